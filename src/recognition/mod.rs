//! Speech recognition sessions
//!
//! A [`SpeechRecognizer`] is the platform speech capability. The turn
//! controller starts it with a [`RecognitionSink`] bound to one session and
//! keeps the matching [`Subscription`]. Detaching the subscription silences
//! the sink, so whatever the recognizer emits while shutting down is dropped.

mod capture;
mod segmenter;
mod stt;

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::session::{SessionId, TurnEvent};
use crate::{Error, Result};

pub use capture::CaptureRecognizer;
pub use segmenter::{SegmentEvent, UtteranceSegmenter, calculate_energy};
pub use stt::{SpeechToText, SttProvider, Transcriber};

/// Recognition settings handed to the capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionOptions {
    /// Locale (e.g. "pt-BR")
    pub language: String,
    /// Keep recognizing across pauses instead of stopping after one phrase
    pub continuous: bool,
    /// Deliver provisional hypotheses as well as final ones
    pub interim_results: bool,
}

impl RecognitionOptions {
    /// Continuous, interim-bearing recognition in `language`
    #[must_use]
    pub fn continuous(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            continuous: true,
            interim_results: true,
        }
    }
}

/// Best alternative of one recognition result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    /// Recognized text
    pub transcript: String,
    /// Whether the hypothesis is final or may still be revised
    pub is_final: bool,
}

impl RecognitionResult {
    /// A finalized segment
    pub fn final_text(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            is_final: true,
        }
    }

    /// A provisional segment
    pub fn interim(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            is_final: false,
        }
    }
}

/// Kind of recognition failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    /// Nothing was heard
    NoSpeech,
    /// Microphone or service access was refused
    PermissionDenied,
    /// No microphone, or it could not be opened
    AudioCapture,
    /// The recognition service could not be reached
    Network,
    /// Recognition was cut short
    Aborted,
    /// Anything else, carrying the platform's kind string
    Other(String),
}

impl FromStr for RecognitionErrorKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "no-speech" => Self::NoSpeech,
            "not-allowed" | "service-not-allowed" => Self::PermissionDenied,
            "audio-capture" => Self::AudioCapture,
            "network" => Self::Network,
            "aborted" => Self::Aborted,
            other => Self::Other(other.to_string()),
        })
    }
}

impl std::fmt::Display for RecognitionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSpeech => f.write_str("no-speech"),
            Self::PermissionDenied => f.write_str("not-allowed"),
            Self::AudioCapture => f.write_str("audio-capture"),
            Self::Network => f.write_str("network"),
            Self::Aborted => f.write_str("aborted"),
            Self::Other(kind) => f.write_str(kind),
        }
    }
}

/// Event delivered by a recognition session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Capture has begun
    Started,
    /// Complete ordered result list of the session so far
    Results(Vec<RecognitionResult>),
    /// The session failed
    Error(RecognitionErrorKind),
    /// The session is over
    Ended,
}

/// Platform speech recognition capability
pub trait SpeechRecognizer: Send {
    /// Whether recognition is supported here at all
    fn is_available(&self) -> bool {
        true
    }

    /// Start a session delivering its events to `sink`
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be started
    fn start(&mut self, sink: RecognitionSink) -> Result<()>;

    /// Stop the running session, if any
    fn stop(&mut self);
}

/// Controller side of a session's event wiring
#[derive(Debug)]
pub struct Subscription {
    session: SessionId,
    attached: Arc<AtomicBool>,
}

impl Subscription {
    /// Create a subscription and the sink feeding `tx`
    #[must_use]
    pub fn attach(
        session: SessionId,
        tx: mpsc::UnboundedSender<TurnEvent>,
    ) -> (Self, RecognitionSink) {
        let attached = Arc::new(AtomicBool::new(true));
        let sink = RecognitionSink {
            session,
            attached: Arc::clone(&attached),
            tx,
        };
        (Self { session, attached }, sink)
    }

    /// Stop forwarding events; later emits are dropped
    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    /// Session this subscription belongs to
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Whether events are still forwarded
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

/// Recognizer side of a session's event wiring
#[derive(Debug, Clone)]
pub struct RecognitionSink {
    session: SessionId,
    attached: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<TurnEvent>,
}

impl RecognitionSink {
    /// Forward an event; returns false if it was dropped
    pub fn emit(&self, event: RecognitionEvent) -> bool {
        if !self.attached.load(Ordering::Acquire) {
            tracing::trace!(session = self.session, ?event, "dropping event from detached session");
            return false;
        }

        self.tx
            .send(TurnEvent::Recognition {
                session: self.session,
                event,
            })
            .is_ok()
    }

    /// Session this sink belongs to
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    pub fn started(&self) -> bool {
        self.emit(RecognitionEvent::Started)
    }

    pub fn results(&self, results: Vec<RecognitionResult>) -> bool {
        self.emit(RecognitionEvent::Results(results))
    }

    pub fn error(&self, kind: RecognitionErrorKind) -> bool {
        self.emit(RecognitionEvent::Error(kind))
    }

    pub fn ended(&self) -> bool {
        self.emit(RecognitionEvent::Ended)
    }
}

/// Recognizer used when speech recognition cannot work on this system
#[derive(Debug, Clone)]
pub struct UnavailableRecognizer {
    reason: String,
}

impl UnavailableRecognizer {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl SpeechRecognizer for UnavailableRecognizer {
    fn is_available(&self) -> bool {
        false
    }

    fn start(&mut self, _sink: RecognitionSink) -> Result<()> {
        Err(Error::RecognitionUnavailable(self.reason.clone()))
    }

    fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_parsing() {
        assert_eq!(
            "no-speech".parse::<RecognitionErrorKind>().unwrap(),
            RecognitionErrorKind::NoSpeech
        );
        assert_eq!(
            "service-not-allowed".parse::<RecognitionErrorKind>().unwrap(),
            RecognitionErrorKind::PermissionDenied
        );
        assert_eq!(
            "language-not-supported".parse::<RecognitionErrorKind>().unwrap(),
            RecognitionErrorKind::Other("language-not-supported".to_string())
        );
    }

    #[test]
    fn test_detached_sink_drops_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (subscription, sink) = Subscription::attach(7, tx);

        assert!(sink.started());
        subscription.detach();
        assert!(!subscription.is_attached());
        assert!(!sink.error(RecognitionErrorKind::Aborted));
        assert!(!sink.ended());

        match rx.try_recv().unwrap() {
            TurnEvent::Recognition { session, event } => {
                assert_eq!(session, 7);
                assert_eq!(event, RecognitionEvent::Started);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unavailable_recognizer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_subscription, sink) = Subscription::attach(1, tx);
        let mut recognizer = UnavailableRecognizer::new("no microphone");

        assert!(!recognizer.is_available());
        assert!(matches!(
            recognizer.start(sink),
            Err(Error::RecognitionUnavailable(_))
        ));
    }
}
