//! Talkback - push-to-talk voice turns against a remote answering service
//!
//! One trigger starts listening. Silence ends the utterance, the transcript
//! is posted to the configured endpoint, and the returned audio is played.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   TurnController                      │
//! │  Idle → Listening → Processing → Playing → Idle      │
//! └───────┬───────────────────┬──────────────────┬───────┘
//!         │                   │                  │
//! ┌───────▼───────┐  ┌────────▼───────┐  ┌───────▼───────┐
//! │SpeechRecognizer│  │ RemoteExchange │  │  AudioOutput  │
//! │ mic + STT      │  │ HTTP POST      │  │ cpal speaker  │
//! └───────────────┘  └────────────────┘  └───────────────┘
//! ```

pub mod config;
pub mod error;
pub mod exchange;
pub mod playback;
pub mod recognition;
pub mod session;
pub mod voice;

pub use config::{Config, TurnConfig};
pub use error::{Error, Result};
pub use exchange::{HttpExchange, RemoteExchange};
pub use playback::{AudioClip, AudioOutput, PlaybackController, PlaybackEvent, ResourceTracker};
pub use recognition::{
    CaptureRecognizer, RecognitionErrorKind, RecognitionEvent, RecognitionResult,
    RecognitionSink, SpeechRecognizer, UnavailableRecognizer,
};
pub use session::{TurnController, TurnEvent, TurnFailure, TurnHandle, TurnStatus, TurnUpdate};
pub use voice::SpeakerOutput;
