//! Turn controller: the state machine behind one conversational turn

use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt as _;
use tokio::sync::{broadcast, mpsc};

use super::{
    ActiveRecognition, SessionId, SessionState, TurnEvent, TurnFailure, TurnHandle, TurnId,
    TurnStatus, TurnUpdate, UPDATE_CAPACITY,
};
use crate::config::TurnConfig;
use crate::exchange::RemoteExchange;
use crate::playback::{AudioOutput, PlaybackController, PlaybackEvent, ResourceTracker};
use crate::recognition::{
    RecognitionErrorKind, RecognitionEvent, RecognitionResult, SpeechRecognizer, Subscription,
};
use crate::Error;

/// Sole authority over [`SessionState`] transitions
///
/// Handlers are synchronous; the exchange and playback run on spawned tasks
/// and report back through the controller's own event channel. Must be
/// driven from within a tokio runtime.
pub struct TurnController {
    config: TurnConfig,
    state: SessionState,
    recognizer: Box<dyn SpeechRecognizer>,
    exchange: Arc<dyn RemoteExchange>,
    playback: PlaybackController,
    events_tx: mpsc::UnboundedSender<TurnEvent>,
    events_rx: mpsc::UnboundedReceiver<TurnEvent>,
    updates: broadcast::Sender<TurnUpdate>,
    last_session: SessionId,
    turn: TurnId,
}

impl TurnController {
    #[must_use]
    pub fn new(
        config: TurnConfig,
        recognizer: Box<dyn SpeechRecognizer>,
        exchange: Arc<dyn RemoteExchange>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);

        Self {
            config,
            state: SessionState::default(),
            recognizer,
            exchange,
            playback: PlaybackController::new(output),
            events_tx,
            events_rx,
            updates,
            last_session: 0,
            turn: 0,
        }
    }

    /// Handle for triggering turns and observing updates
    #[must_use]
    pub fn handle(&self) -> TurnHandle {
        TurnHandle {
            events: self.events_tx.clone(),
            updates: self.updates.clone(),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TurnUpdate> {
        self.updates.subscribe()
    }

    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    #[must_use]
    pub const fn status(&self) -> TurnStatus {
        self.state.status
    }

    /// Playback resource accounting
    #[must_use]
    pub const fn playback_resources(&self) -> &ResourceTracker {
        self.playback.tracker()
    }

    /// The user's trigger action, interpreted by current status
    pub fn trigger(&mut self) {
        match self.state.status {
            TurnStatus::Idle | TurnStatus::Error => self.begin_turn(),
            TurnStatus::Listening => self.finalize(),
            TurnStatus::Processing | TurnStatus::Playing => {
                tracing::debug!(status = ?self.state.status, "trigger ignored while busy");
            }
        }
    }

    /// Start listening for a new utterance
    pub fn begin_turn(&mut self) {
        if !self.state.status.can_begin() {
            tracing::debug!(status = ?self.state.status, "cannot begin a turn now");
            return;
        }

        self.state.transcript.clear();
        self.state.finalizing = false;
        self.state.message = None;
        self.state.failure = None;
        self.publish_transcript();

        if !self.recognizer.is_available() {
            tracing::warn!("speech recognition unavailable");
            self.fail(TurnFailure::Unavailable(
                "speech recognizer reports itself unavailable".to_string(),
            ));
            return;
        }

        self.last_session += 1;
        let session = self.last_session;
        let (subscription, sink) = Subscription::attach(session, self.events_tx.clone());

        if let Err(e) = self.recognizer.start(sink) {
            subscription.detach();
            tracing::warn!(session, error = %e, "failed to start recognition");
            let failure = match e {
                Error::RecognitionUnavailable(reason) => TurnFailure::Unavailable(reason),
                other => TurnFailure::Recognition(RecognitionErrorKind::Other(other.to_string())),
            };
            self.fail(failure);
            return;
        }

        tracing::info!(session, "turn started");
        self.state.active = Some(ActiveRecognition { subscription });
        self.transition(TurnStatus::Listening);
        self.arm_silence(self.config.no_speech_window);
    }

    /// The recognizer has begun capturing
    pub fn on_recognition_start(&mut self) {
        if self.state.finalizing || self.state.active.is_none() {
            return;
        }

        if self.state.status == TurnStatus::Idle {
            self.transition(TurnStatus::Listening);
        }

        // Give the user the full no-speech window from the real start of capture
        if self.state.status == TurnStatus::Listening && !self.state.transcript.has_deliveries() {
            self.arm_silence(self.config.no_speech_window);
        }
    }

    /// New partial or final results for the current utterance
    pub fn on_speech_fragment(&mut self, results: &[RecognitionResult]) {
        if self.state.status != TurnStatus::Listening || self.state.finalizing {
            tracing::trace!(status = ?self.state.status, "ignoring late speech fragment");
            return;
        }

        self.state.transcript.rebuild(results);
        self.publish_transcript();
        self.arm_silence(self.config.silence_window);
    }

    /// The recognition session failed
    pub fn on_recognition_error(&mut self, kind: RecognitionErrorKind) {
        if self.state.finalizing || self.state.status != TurnStatus::Listening {
            tracing::trace!(%kind, status = ?self.state.status, "suppressing recognition error");
            return;
        }

        tracing::warn!(%kind, "recognition error");
        self.fail(TurnFailure::Recognition(kind));
    }

    /// The recognition session ended without being stopped
    pub fn on_recognition_end(&mut self) {
        if self.state.finalizing || self.state.status != TurnStatus::Listening {
            return;
        }

        tracing::debug!("recognition ended on its own, finalizing");
        self.finalize();
    }

    /// Close out the Listening phase; at most once per turn
    pub fn finalize(&mut self) {
        if self.state.finalizing {
            tracing::debug!("finalization already in progress");
            return;
        }
        if self.state.status != TurnStatus::Listening {
            tracing::debug!(status = ?self.state.status, "nothing to finalize");
            return;
        }

        self.state.finalizing = true;
        self.state.silence.cancel();
        self.stop_recognition();

        let text = self.state.transcript.trimmed().to_string();
        if text.is_empty() {
            tracing::info!("no speech captured, returning to idle");
            self.state.finalizing = false;
            self.transition(TurnStatus::Idle);
            return;
        }

        self.turn += 1;
        let turn = self.turn;
        tracing::info!(turn, chars = text.len(), "sending transcript");
        self.transition(TurnStatus::Processing);

        let exchange = Arc::clone(&self.exchange);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(exchange.send(&text))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Communication("exchange panicked".to_string())));

            if events.send(TurnEvent::ExchangeCompleted { turn, result }).is_err() {
                tracing::trace!(turn, "turn controller gone, dropping exchange result");
            }
        });
    }

    /// The remote exchange for `turn` finished
    pub fn on_exchange_completed(&mut self, turn: TurnId, result: crate::Result<Vec<u8>>) {
        if turn != self.turn || self.state.status != TurnStatus::Processing {
            tracing::trace!(turn, "ignoring stale exchange result");
            return;
        }

        match result {
            Ok(payload) => {
                tracing::debug!(turn, bytes = payload.len(), "exchange succeeded");
                // Runs detached; progress comes back as playback events
                drop(self.playback.play(turn, payload, self.events_tx.clone()));
            }
            Err(e) => {
                tracing::warn!(turn, error = %e, "exchange failed");
                self.fail(TurnFailure::Communication);
            }
        }
    }

    /// Playback for `turn` progressed
    pub fn on_playback(&mut self, turn: TurnId, event: PlaybackEvent) {
        let in_flight = matches!(
            self.state.status,
            TurnStatus::Processing | TurnStatus::Playing
        );
        if turn != self.turn || !in_flight {
            tracing::trace!(turn, ?event, "ignoring stale playback event");
            return;
        }

        match event {
            PlaybackEvent::Started => {
                if self.state.status == TurnStatus::Processing {
                    self.transition(TurnStatus::Playing);
                }
            }
            PlaybackEvent::Ended => {
                tracing::info!(turn, "turn complete");
                self.state.finalizing = false;
                self.transition(TurnStatus::Idle);
            }
            PlaybackEvent::Failed(reason) => {
                tracing::warn!(turn, reason = %reason, "playback failed");
                self.fail(TurnFailure::Playback);
            }
        }
    }

    /// Process one event
    pub fn dispatch(&mut self, event: TurnEvent) -> ControlFlow<()> {
        match event {
            TurnEvent::Trigger => self.trigger(),
            TurnEvent::Recognition { session, event } => self.on_recognition(session, event),
            TurnEvent::SilenceElapsed { token } => {
                if self.state.silence.claim(token) {
                    tracing::debug!(status = ?self.state.status, "silence window elapsed");
                    self.finalize();
                } else {
                    tracing::trace!(token, "ignoring stale silence timer");
                }
            }
            TurnEvent::ExchangeCompleted { turn, result } => {
                self.on_exchange_completed(turn, result);
            }
            TurnEvent::Playback { turn, event } => self.on_playback(turn, event),
            TurnEvent::Shutdown => {
                self.shutdown();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Wait for the next event and process it
    pub async fn step(&mut self) -> ControlFlow<()> {
        match self.events_rx.recv().await {
            Some(event) => self.dispatch(event),
            None => ControlFlow::Break(()),
        }
    }

    /// Process events until shutdown
    pub async fn run(mut self) {
        tracing::debug!("turn controller running");
        while self.step().await.is_continue() {}
        tracing::info!("turn controller stopped");
    }

    fn on_recognition(&mut self, session: SessionId, event: RecognitionEvent) {
        let current = self
            .state
            .active
            .as_ref()
            .is_some_and(|active| active.session() == session && active.is_attached());
        if !current {
            tracing::trace!(session, ?event, "ignoring event from inactive session");
            return;
        }

        match event {
            RecognitionEvent::Started => self.on_recognition_start(),
            RecognitionEvent::Results(results) => self.on_speech_fragment(&results),
            RecognitionEvent::Error(kind) => self.on_recognition_error(kind),
            RecognitionEvent::Ended => self.on_recognition_end(),
        }
    }

    fn shutdown(&mut self) {
        self.state.silence.cancel();
        self.stop_recognition();
    }

    /// Detach first, then stop, so shutdown noise never reaches the handlers
    fn stop_recognition(&mut self) {
        if let Some(active) = self.state.active.take() {
            active.subscription.detach();
            self.recognizer.stop();
            tracing::debug!(session = active.session(), "recognition stopped");
        }
    }

    fn arm_silence(&mut self, window: Duration) {
        let events = self.events_tx.clone();
        self.state.silence.arm(window, move |token| {
            let _ = events.send(TurnEvent::SilenceElapsed { token });
        });
    }

    /// Enter Error, releasing everything the turn held
    fn fail(&mut self, failure: TurnFailure) {
        self.state.silence.cancel();
        self.stop_recognition();
        self.state.finalizing = false;
        self.state.message = Some(failure.message());
        self.state.failure = Some(failure);
        self.transition(TurnStatus::Error);
    }

    fn transition(&mut self, status: TurnStatus) {
        tracing::debug!(from = ?self.state.status, to = ?status, "status transition");
        self.state.status = status;

        if status != TurnStatus::Error {
            self.state.message = None;
            self.state.failure = None;
        }

        // No subscribers is fine
        let _ = self.updates.send(TurnUpdate::Status {
            status,
            message: self.state.message.clone(),
        });
    }

    fn publish_transcript(&self) {
        let _ = self.updates.send(TurnUpdate::Transcript {
            finalized: self.state.transcript.finalized().to_string(),
            interim: self.state.transcript.interim().to_string(),
        });
    }
}
