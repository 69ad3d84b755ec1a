//! Session state owned by the turn controller

use super::{SessionId, SilenceTimer, TranscriptAccumulator, TurnFailure, TurnStatus};
use crate::recognition::Subscription;

/// The running recognition session
#[derive(Debug)]
pub struct ActiveRecognition {
    pub(super) subscription: Subscription,
}

impl ActiveRecognition {
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.subscription.session()
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.subscription.is_attached()
    }
}

/// State of the conversational turn
///
/// Invariants kept by the controller:
/// - `Listening` implies an active recognition and no finalization in flight
/// - the silence timer is pending exactly while `Listening`
#[derive(Debug)]
pub struct SessionState {
    pub(super) status: TurnStatus,
    pub(super) message: Option<String>,
    pub(super) failure: Option<TurnFailure>,
    pub(super) transcript: TranscriptAccumulator,
    pub(super) finalizing: bool,
    pub(super) silence: SilenceTimer,
    pub(super) active: Option<ActiveRecognition>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: TurnStatus::Idle,
            message: None,
            failure: None,
            transcript: TranscriptAccumulator::new(),
            finalizing: false,
            silence: SilenceTimer::new(),
            active: None,
        }
    }
}

impl SessionState {
    #[must_use]
    pub const fn status(&self) -> TurnStatus {
        self.status
    }

    /// User-facing text for the current status
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Cause of the current Error status
    #[must_use]
    pub const fn failure(&self) -> Option<&TurnFailure> {
        self.failure.as_ref()
    }

    #[must_use]
    pub const fn transcript(&self) -> &TranscriptAccumulator {
        &self.transcript
    }

    #[must_use]
    pub const fn is_finalizing(&self) -> bool {
        self.finalizing
    }

    #[must_use]
    pub const fn silence_pending(&self) -> bool {
        self.silence.is_pending()
    }

    #[must_use]
    pub const fn active_recognition(&self) -> Option<&ActiveRecognition> {
        self.active.as_ref()
    }
}
