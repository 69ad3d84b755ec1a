//! Turn-taking session
//!
//! The [`TurnController`] owns a single [`SessionState`] and moves it through
//! Idle → Listening → Processing → Playing, falling back to Idle or Error.
//! Everything that happens asynchronously (recognition results, timer fires,
//! network completions, playback progress) arrives as a [`TurnEvent`] on the
//! controller's channel and is handled one event at a time.

mod controller;
mod state;
mod timer;
mod transcript;

use std::fmt;
use std::io::BufRead;

use tokio::sync::{broadcast, mpsc};

use crate::Result;
use crate::playback::PlaybackEvent;
use crate::recognition::{RecognitionErrorKind, RecognitionEvent};

pub use controller::TurnController;
pub use state::{ActiveRecognition, SessionState};
pub use timer::{SilenceTimer, TimerToken};
pub use transcript::TranscriptAccumulator;

/// Identifies one recognition session
pub type SessionId = u64;

/// Identifies one exchange and its playback
pub type TurnId = u64;

/// Capacity of the update broadcast channel
const UPDATE_CAPACITY: usize = 64;

/// Where the current turn stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnStatus {
    /// Waiting for the user
    Idle,
    /// Capturing speech
    Listening,
    /// Waiting on the remote exchange
    Processing,
    /// Playing the response
    Playing,
    /// The last turn failed
    Error,
}

impl TurnStatus {
    /// Whether a new turn may begin from here
    #[must_use]
    pub const fn can_begin(self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }

    /// Short user-facing label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "Ready",
            Self::Listening => "Listening...",
            Self::Processing => "Thinking...",
            Self::Playing => "Speaking...",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a turn ended in Error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnFailure {
    /// Speech recognition is not supported here
    Unavailable(String),
    /// The recognition session failed
    Recognition(RecognitionErrorKind),
    /// The remote exchange failed
    Communication,
    /// The response could not be played
    Playback,
}

impl TurnFailure {
    /// User-facing status text
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Unavailable(_) => {
                "Speech recognition is not available on this system.".to_string()
            }
            Self::Recognition(RecognitionErrorKind::NoSpeech) => {
                "No speech was detected. Please try again.".to_string()
            }
            Self::Recognition(RecognitionErrorKind::PermissionDenied) => {
                "Microphone access was denied.".to_string()
            }
            Self::Recognition(kind) => format!("Speech recognition failed ({kind})."),
            Self::Communication => "Could not reach the server. Please try again.".to_string(),
            Self::Playback => "Could not play the response.".to_string(),
        }
    }
}

/// Everything the turn controller reacts to
#[derive(Debug)]
pub enum TurnEvent {
    /// The user's single trigger action
    Trigger,
    /// An event from a recognition session
    Recognition {
        session: SessionId,
        event: RecognitionEvent,
    },
    /// The silence timer ran out
    SilenceElapsed { token: TimerToken },
    /// The remote exchange finished
    ExchangeCompleted { turn: TurnId, result: Result<Vec<u8>> },
    /// Playback progressed
    Playback { turn: TurnId, event: PlaybackEvent },
    /// Stop the controller loop
    Shutdown,
}

/// What the presentation layer is told
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnUpdate {
    /// The status changed
    Status {
        status: TurnStatus,
        message: Option<String>,
    },
    /// The transcript changed
    Transcript { finalized: String, interim: String },
}

/// Cloneable access to a running controller
#[derive(Debug, Clone)]
pub struct TurnHandle {
    events: mpsc::UnboundedSender<TurnEvent>,
    updates: broadcast::Sender<TurnUpdate>,
}

impl TurnHandle {
    /// Deliver the user's trigger action; false if the controller is gone
    pub fn trigger(&self) -> bool {
        self.events.send(TurnEvent::Trigger).is_ok()
    }

    /// Ask the controller loop to stop
    pub fn shutdown(&self) -> bool {
        self.events.send(TurnEvent::Shutdown).is_ok()
    }

    /// Receive status and transcript updates
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TurnUpdate> {
        self.updates.subscribe()
    }

    /// Trigger once per input line until `q` or end of input, then shut down
    ///
    /// Blocks the calling thread. Returns early once the controller is gone.
    pub fn read_triggers<R: BufRead>(&self, input: R) {
        for line in input.lines() {
            match line {
                Ok(line) if line.trim().eq_ignore_ascii_case("q") => break,
                Ok(_) => {
                    if !self.trigger() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read trigger input");
                    break;
                }
            }
        }
        self.shutdown();
    }
}
