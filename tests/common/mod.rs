//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use talkback::{
    AudioClip, AudioOutput, Error, RecognitionErrorKind, RecognitionResult, RecognitionSink,
    RemoteExchange, Result, SpeechRecognizer, TurnConfig, TurnController, TurnStatus, TurnUpdate,
};

/// Upper bound on waiting for a single event
const STEP_LIMIT: Duration = Duration::from_secs(60);

/// Shared view into a [`ScriptedRecognizer`]
#[derive(Default)]
pub struct RecognizerProbe {
    starts: AtomicUsize,
    stops: AtomicUsize,
    sink: Mutex<Option<RecognitionSink>>,
}

impl RecognizerProbe {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Sink of the most recently started session
    pub fn sink(&self) -> RecognitionSink {
        self.sink
            .lock()
            .unwrap()
            .clone()
            .expect("recognizer was never started")
    }

    pub fn started(&self) -> bool {
        self.sink().started()
    }

    pub fn finals(&self, segments: &[&str]) -> bool {
        self.sink().results(
            segments
                .iter()
                .map(|s| RecognitionResult::final_text(*s))
                .collect(),
        )
    }

    pub fn results(&self, results: Vec<RecognitionResult>) -> bool {
        self.sink().results(results)
    }

    pub fn error(&self, kind: RecognitionErrorKind) -> bool {
        self.sink().error(kind)
    }

    pub fn ended(&self) -> bool {
        self.sink().ended()
    }
}

/// Recognizer driven by the test through its probe
///
/// Stopping emits the abort noise a real platform produces.
pub struct ScriptedRecognizer {
    probe: Arc<RecognizerProbe>,
    available: bool,
    start_error: Option<String>,
}

impl ScriptedRecognizer {
    pub fn new() -> (Self, Arc<RecognizerProbe>) {
        let probe = Arc::new(RecognizerProbe::default());
        let recognizer = Self {
            probe: Arc::clone(&probe),
            available: true,
            start_error: None,
        };
        (recognizer, probe)
    }

    pub fn unavailable() -> (Self, Arc<RecognizerProbe>) {
        let (mut recognizer, probe) = Self::new();
        recognizer.available = false;
        (recognizer, probe)
    }

    pub fn failing_start(reason: &str) -> (Self, Arc<RecognizerProbe>) {
        let (mut recognizer, probe) = Self::new();
        recognizer.start_error = Some(reason.to_string());
        (recognizer, probe)
    }
}

impl SpeechRecognizer for ScriptedRecognizer {
    fn is_available(&self) -> bool {
        self.available
    }

    fn start(&mut self, sink: RecognitionSink) -> Result<()> {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.start_error {
            return Err(Error::Audio(reason.clone()));
        }
        *self.probe.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(sink) = self.probe.sink.lock().unwrap().as_ref() {
            sink.error(RecognitionErrorKind::Aborted);
            sink.ended();
        }
    }
}

/// Exchange recording every request
#[derive(Default)]
pub struct CountingExchange {
    requests: Mutex<Vec<(String, Instant)>>,
    reply: Option<Vec<u8>>,
    delay: Duration,
}

impl CountingExchange {
    /// Answers every request with `reply`
    pub fn replying(reply: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_vec()),
            ..Self::default()
        })
    }

    /// Answers after `delay`
    pub fn slow(reply: &[u8], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_vec()),
            delay,
            ..Self::default()
        })
    }

    /// Fails every request as a non-success response would
    pub fn failing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn transcripts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(text, _)| text.clone())
            .collect()
    }

    /// When the first request was sent
    pub fn first_sent_at(&self) -> Option<Instant> {
        self.requests.lock().unwrap().first().map(|(_, at)| *at)
    }
}

#[async_trait]
impl RemoteExchange for CountingExchange {
    async fn send(&self, transcript: &str) -> Result<Vec<u8>> {
        self.requests
            .lock()
            .unwrap()
            .push((transcript.to_string(), Instant::now()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.reply
            .clone()
            .ok_or_else(|| Error::Communication("server returned 500".to_string()))
    }
}

/// Output counting plays without touching a device
#[derive(Default)]
pub struct CountingOutput {
    plays: AtomicUsize,
    fail_play: AtomicBool,
}

impl CountingOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Device fails once playback has started
    pub fn failing() -> Arc<Self> {
        let output = Self::default();
        output.fail_play.store(true, Ordering::SeqCst);
        Arc::new(output)
    }

    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioOutput for CountingOutput {
    fn prepare(&self, payload: &[u8]) -> Result<AudioClip> {
        if payload.is_empty() {
            return Err(Error::Playback("empty payload".to_string()));
        }
        Ok(AudioClip::new(vec![0.1; 1600], 16000))
    }

    async fn play(&self, clip: &AudioClip) -> Result<()> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(clip.duration()).await;

        if self.fail_play.load(Ordering::SeqCst) {
            return Err(Error::Playback("device lost".to_string()));
        }
        Ok(())
    }
}

/// Controller wired to the given doubles with default windows
pub fn controller(
    recognizer: ScriptedRecognizer,
    exchange: Arc<CountingExchange>,
    output: Arc<CountingOutput>,
) -> TurnController {
    TurnController::new(TurnConfig::default(), Box::new(recognizer), exchange, output)
}

/// Process events until `done` holds; false if it never does
pub async fn step_until<F>(controller: &mut TurnController, done: F) -> bool
where
    F: Fn(&TurnController) -> bool,
{
    for _ in 0..64 {
        if done(controller) {
            return true;
        }
        if tokio::time::timeout(STEP_LIMIT, controller.step())
            .await
            .is_err()
        {
            break;
        }
    }
    done(controller)
}

/// Process events until the controller reports `status`
pub async fn step_until_status(controller: &mut TurnController, status: TurnStatus) -> bool {
    step_until(controller, |c| c.status() == status).await
}

/// Process whatever is already queued
pub async fn drain(controller: &mut TurnController) {
    while let Ok(flow) = tokio::time::timeout(Duration::ZERO, controller.step()).await {
        if flow.is_break() {
            break;
        }
    }
}

/// Every status published so far
pub fn statuses(updates: &mut tokio::sync::broadcast::Receiver<TurnUpdate>) -> Vec<TurnStatus> {
    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        if let TurnUpdate::Status { status, .. } = update {
            seen.push(status);
        }
    }
    seen
}
