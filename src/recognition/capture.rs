//! Microphone-backed speech recognizer
//!
//! A capture thread owns the microphone (cpal streams are not `Send`) and
//! turns audio into activity and utterance signals. A tokio task transcribes
//! each utterance and reports the growing result list to the sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::{
    RecognitionErrorKind, RecognitionOptions, RecognitionResult, RecognitionSink, SegmentEvent,
    SpeechRecognizer, SpeechToText, Transcriber, UtteranceSegmenter,
};
use crate::voice::{Microphone, SAMPLE_RATE, samples_to_wav};
use crate::{Config, Error, Result};

/// Audio handed to the segmenter per step
const BLOCK_WINDOW: Duration = Duration::from_millis(100);

/// How often a pending transcription is re-announced
const TRANSCRIBE_KEEPALIVE: Duration = Duration::from_millis(500);

/// What the capture thread hands to the transcription task
#[derive(Debug)]
enum CaptureSignal {
    /// Voice activity within an utterance
    Activity,
    /// A finished utterance awaiting transcription
    Utterance(Vec<f32>),
}

/// Speech recognizer built from microphone capture and an STT service
pub struct CaptureRecognizer {
    options: RecognitionOptions,
    transcriber: Option<Arc<dyn Transcriber>>,
    transcribe_limit: Duration,
    unavailable_reason: String,
    stop_flag: Option<Arc<AtomicBool>>,
}

impl CaptureRecognizer {
    /// Create a recognizer; an utterance not transcribed within `limit` is a
    /// network failure
    #[must_use]
    pub fn new(
        options: RecognitionOptions,
        transcriber: Arc<dyn Transcriber>,
        limit: Duration,
    ) -> Self {
        Self {
            options,
            transcriber: Some(transcriber),
            transcribe_limit: limit,
            unavailable_reason: String::new(),
            stop_flag: None,
        }
    }

    /// Create a recognizer from configuration
    ///
    /// A missing STT key yields a recognizer that reports itself unavailable.
    /// Transcriptions share the exchange request timeout.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let options = RecognitionOptions::continuous(config.recognition.language.clone());
        let provider = config.recognition.provider;
        let limit = config.exchange.timeout;

        let Some(key) = config.api_keys.for_provider(provider) else {
            return Self::unavailable(options, format!("no API key configured for {provider:?}"));
        };

        match SpeechToText::new(
            provider,
            key.expose_secret(),
            config.recognition.model.clone(),
            config.recognition.language.clone(),
            limit,
        ) {
            Ok(stt) => Self::new(options, Arc::new(stt), limit),
            Err(e) => Self::unavailable(options, e.to_string()),
        }
    }

    fn unavailable(options: RecognitionOptions, reason: String) -> Self {
        tracing::warn!(reason = %reason, "speech recognition unavailable");
        Self {
            options,
            transcriber: None,
            transcribe_limit: Duration::ZERO,
            unavailable_reason: reason,
            stop_flag: None,
        }
    }

    /// Recognition options in effect
    #[must_use]
    pub const fn options(&self) -> &RecognitionOptions {
        &self.options
    }
}

impl SpeechRecognizer for CaptureRecognizer {
    fn is_available(&self) -> bool {
        self.transcriber.is_some()
    }

    fn start(&mut self, sink: RecognitionSink) -> Result<()> {
        let transcriber = self
            .transcriber
            .clone()
            .ok_or_else(|| Error::RecognitionUnavailable(self.unavailable_reason.clone()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Recognition(format!("no async runtime: {e}")))?;

        // One session at a time
        self.stop();

        let stop = Arc::new(AtomicBool::new(false));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let thread_stop = Arc::clone(&stop);
        let thread_sink = sink.clone();
        std::thread::Builder::new()
            .name("talkback-capture".to_string())
            .spawn(move || capture_loop(&thread_stop, &thread_sink, &signal_tx))?;

        runtime.spawn(transcribe_loop(
            transcriber,
            self.transcribe_limit,
            sink.clone(),
            signal_rx,
        ));

        tracing::debug!(
            session = sink.session(),
            language = %self.options.language,
            "capture recognizer started"
        );
        self.stop_flag = Some(stop);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop_flag.take() {
            stop.store(true, Ordering::Release);
            tracing::debug!("capture recognizer stopping");
        }
    }
}

impl Drop for CaptureRecognizer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs on the capture thread until `stop` is raised or input fails
///
/// Dropping `signals` on return ends the transcription task.
fn capture_loop(
    stop: &AtomicBool,
    sink: &RecognitionSink,
    signals: &mpsc::UnboundedSender<CaptureSignal>,
) {
    let microphone = match Microphone::open() {
        Ok(microphone) => microphone,
        Err(e) => {
            tracing::error!(error = %e, "failed to open microphone");
            sink.error(classify_capture_error(&e));
            return;
        }
    };

    sink.started();
    let mut segmenter = UtteranceSegmenter::new();

    while !stop.load(Ordering::Acquire) {
        let block = match microphone.read(BLOCK_WINDOW) {
            Ok(block) if block.is_empty() => continue,
            Ok(block) => block,
            Err(e) => {
                tracing::error!(error = %e, "microphone input failed");
                sink.error(classify_capture_error(&e));
                break;
            }
        };

        let signal = match segmenter.push(&block) {
            SegmentEvent::Silence => continue,
            SegmentEvent::Speaking => CaptureSignal::Activity,
            SegmentEvent::Complete(utterance) => CaptureSignal::Utterance(utterance),
        };

        if signals.send(signal).is_err() {
            break;
        }
    }
}

/// Transcribes utterances in delivery order and reports results
///
/// Activity, and every [`TRANSCRIBE_KEEPALIVE`] while a transcription is in
/// flight, report the results so far plus an empty interim hypothesis.
async fn transcribe_loop(
    transcriber: Arc<dyn Transcriber>,
    limit: Duration,
    sink: RecognitionSink,
    mut signals: mpsc::UnboundedReceiver<CaptureSignal>,
) {
    let mut results: Vec<RecognitionResult> = Vec::new();

    while let Some(signal) = signals.recv().await {
        let samples = match signal {
            CaptureSignal::Activity => {
                sink.results(with_pending_interim(&results));
                continue;
            }
            CaptureSignal::Utterance(samples) => samples,
        };

        let pending = tokio::time::timeout(limit, transcribe_utterance(&*transcriber, &samples));
        tokio::pin!(pending);
        let mut keepalive =
            tokio::time::interval_at(Instant::now() + TRANSCRIBE_KEEPALIVE, TRANSCRIBE_KEEPALIVE);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                outcome = &mut pending => break outcome,
                _ = keepalive.tick() => {
                    sink.results(with_pending_interim(&results));
                }
            }
        };

        match outcome {
            Ok(Ok(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let segment = if results.is_empty() {
                    text.to_string()
                } else {
                    format!(" {text}")
                };
                results.push(RecognitionResult::final_text(segment));
                sink.results(results.clone());
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "utterance transcription failed");
                sink.error(RecognitionErrorKind::Network);
            }
            Err(_) => {
                tracing::warn!(limit = ?limit, "utterance transcription timed out");
                sink.error(RecognitionErrorKind::Network);
            }
        }
    }

    sink.ended();
}

async fn transcribe_utterance(transcriber: &dyn Transcriber, samples: &[f32]) -> Result<String> {
    let wav = samples_to_wav(samples, SAMPLE_RATE)?;
    transcriber.transcribe(&wav).await
}

/// Results so far plus an empty interim hypothesis
fn with_pending_interim(results: &[RecognitionResult]) -> Vec<RecognitionResult> {
    let mut snapshot = results.to_vec();
    snapshot.push(RecognitionResult::interim(""));
    snapshot
}

fn classify_capture_error(error: &Error) -> RecognitionErrorKind {
    let message = error.to_string().to_lowercase();
    if message.contains("permission") || message.contains("denied") {
        RecognitionErrorKind::PermissionDenied
    } else {
        RecognitionErrorKind::AudioCapture
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::file::TalkbackConfigFile;
    use crate::recognition::{RecognitionEvent, Subscription};
    use crate::session::TurnEvent;

    const LIMIT: Duration = Duration::from_secs(2);

    /// Answers from a script after a fixed delay
    struct ScriptedTranscriber {
        replies: Mutex<VecDeque<Result<String>>>,
        delay: Duration,
    }

    impl ScriptedTranscriber {
        fn new(replies: Vec<Result<String>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                delay,
            })
        }
    }

    #[async_trait]
    impl Transcriber for ScriptedTranscriber {
        async fn transcribe(&self, wav: &[u8]) -> Result<String> {
            assert_eq!(&wav[0..4], b"RIFF");
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    /// Never answers
    struct StalledTranscriber;

    #[async_trait]
    impl Transcriber for StalledTranscriber {
        async fn transcribe(&self, _wav: &[u8]) -> Result<String> {
            std::future::pending().await
        }
    }

    fn spawn_loop(
        transcriber: Arc<dyn Transcriber>,
    ) -> (
        mpsc::UnboundedSender<CaptureSignal>,
        mpsc::UnboundedReceiver<TurnEvent>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (_subscription, sink) = Subscription::attach(1, events_tx);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        tokio::spawn(transcribe_loop(transcriber, LIMIT, sink, signal_rx));
        (signal_tx, events_rx)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<TurnEvent>) -> RecognitionEvent {
        match events.recv().await {
            Some(TurnEvent::Recognition { session: 1, event }) => event,
            other => panic!("unexpected event {other:?}"),
        }
    }

    fn utterance() -> CaptureSignal {
        CaptureSignal::Utterance(vec![0.2; 1600])
    }

    fn finals(segments: &[&str]) -> RecognitionEvent {
        RecognitionEvent::Results(
            segments
                .iter()
                .map(|s| RecognitionResult::final_text(*s))
                .collect(),
        )
    }

    fn pending(segments: &[&str]) -> RecognitionEvent {
        let mut results: Vec<_> = segments
            .iter()
            .map(|s| RecognitionResult::final_text(*s))
            .collect();
        results.push(RecognitionResult::interim(""));
        RecognitionEvent::Results(results)
    }

    #[test]
    fn test_missing_key_is_unavailable() {
        let config = Config::from_sources(TalkbackConfigFile::default(), |_| None).unwrap();
        let recognizer = CaptureRecognizer::from_config(&config);

        assert!(!recognizer.is_available());
        assert_eq!(recognizer.options().language, "pt-BR");
        assert!(recognizer.options().continuous);
        assert!(recognizer.options().interim_results);
    }

    #[test]
    fn test_configured_key_is_available() {
        let env = |key: &str| (key == "OPENAI_API_KEY").then(|| "sk-test".to_string());
        let config = Config::from_sources(TalkbackConfigFile::default(), env).unwrap();
        let recognizer = CaptureRecognizer::from_config(&config);

        assert!(recognizer.is_available());
        assert_eq!(recognizer.transcribe_limit, config.exchange.timeout);
    }

    #[test]
    fn test_classify_capture_error() {
        assert_eq!(
            classify_capture_error(&Error::Audio("Permission denied (os error 13)".to_string())),
            RecognitionErrorKind::PermissionDenied
        );
        assert_eq!(
            classify_capture_error(&Error::Audio("no input device available".to_string())),
            RecognitionErrorKind::AudioCapture
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_utterances_accumulate_in_order() {
        let transcriber = ScriptedTranscriber::new(
            vec![
                Ok(" oi ".to_string()),
                Ok("   ".to_string()),
                Ok("tudo bem".to_string()),
            ],
            Duration::ZERO,
        );
        let (signals, mut events) = spawn_loop(transcriber);

        signals.send(CaptureSignal::Activity).unwrap();
        signals.send(utterance()).unwrap();
        signals.send(CaptureSignal::Activity).unwrap();
        signals.send(utterance()).unwrap();
        signals.send(utterance()).unwrap();
        drop(signals);

        assert_eq!(next_event(&mut events).await, pending(&[]));
        assert_eq!(next_event(&mut events).await, finals(&["oi"]));
        assert_eq!(next_event(&mut events).await, pending(&["oi"]));
        assert_eq!(next_event(&mut events).await, finals(&["oi", " tudo bem"]));
        assert_eq!(next_event(&mut events).await, RecognitionEvent::Ended);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_transcription_is_network_error() {
        let transcriber = ScriptedTranscriber::new(
            vec![
                Err(Error::Stt("Whisper API error 503".to_string())),
                Ok("de novo".to_string()),
            ],
            Duration::ZERO,
        );
        let (signals, mut events) = spawn_loop(transcriber);

        signals.send(utterance()).unwrap();
        signals.send(utterance()).unwrap();
        drop(signals);

        assert_eq!(
            next_event(&mut events).await,
            RecognitionEvent::Error(RecognitionErrorKind::Network)
        );
        assert_eq!(next_event(&mut events).await, finals(&["de novo"]));
        assert_eq!(next_event(&mut events).await, RecognitionEvent::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transcription_keeps_announcing() {
        let transcriber =
            ScriptedTranscriber::new(vec![Ok("oi".to_string())], Duration::from_millis(1200));
        let (signals, mut events) = spawn_loop(transcriber);
        let started = Instant::now();

        signals.send(utterance()).unwrap();

        assert_eq!(next_event(&mut events).await, pending(&[]));
        assert!(started.elapsed() >= TRANSCRIBE_KEEPALIVE);
        assert_eq!(next_event(&mut events).await, pending(&[]));
        assert_eq!(next_event(&mut events).await, finals(&["oi"]));
        assert!(started.elapsed() >= Duration::from_millis(1200));

        drop(signals);
        assert_eq!(next_event(&mut events).await, RecognitionEvent::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_transcription_gives_up() {
        let (signals, mut events) = spawn_loop(Arc::new(StalledTranscriber));
        let started = Instant::now();

        signals.send(utterance()).unwrap();
        drop(signals);

        let mut announcements = 0;
        let failure = loop {
            match next_event(&mut events).await {
                RecognitionEvent::Results(results) => {
                    assert_eq!(results, vec![RecognitionResult::interim("")]);
                    announcements += 1;
                }
                other => break other,
            }
        };

        assert_eq!(failure, RecognitionEvent::Error(RecognitionErrorKind::Network));
        assert!(started.elapsed() >= LIMIT);
        assert!(announcements >= 3);
        assert_eq!(next_event(&mut events).await, RecognitionEvent::Ended);
        assert!(events.recv().await.is_none());
    }
}
