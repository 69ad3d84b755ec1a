//! Restartable single-shot silence timer

use std::time::Duration;

use tokio::task::JoinHandle;

/// Identifies one arming of the timer
pub type TimerToken = u64;

/// A single-shot delay that can be restarted or cancelled
///
/// Each arming gets a fresh [`TimerToken`]. A fire is only honoured by
/// [`SilenceTimer::claim`] if its token is still current, so a fire that was
/// already queued when the timer was re-armed or cancelled is discarded.
#[derive(Debug, Default)]
pub struct SilenceTimer {
    pending: Option<JoinHandle<()>>,
    token: TimerToken,
}

impl SilenceTimer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending delay and schedule `on_fire` after `window`
    ///
    /// Must be called within a tokio runtime.
    pub fn arm<F>(&mut self, window: Duration, on_fire: F) -> TimerToken
    where
        F: FnOnce(TimerToken) + Send + 'static,
    {
        self.cancel();
        let token = self.token;

        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            on_fire(token);
        }));

        tracing::trace!(token, window_ms = window.as_millis(), "silence timer armed");
        token
    }

    /// Clear the pending delay, if any
    pub fn cancel(&mut self) {
        self.token = self.token.wrapping_add(1);
        if let Some(handle) = self.pending.take() {
            handle.abort();
            tracing::trace!("silence timer cancelled");
        }
    }

    /// Accept a fire for `token`; true only for the current arming
    pub fn claim(&mut self, token: TimerToken) -> bool {
        if self.pending.is_none() || token != self.token {
            return false;
        }
        self.pending = None;
        self.token = self.token.wrapping_add(1);
        true
    }

    /// Whether an arming is outstanding
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for SilenceTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}
