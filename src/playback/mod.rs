//! Playback of remote audio responses
//!
//! The [`PlaybackController`] turns a payload into a playable [`AudioClip`],
//! plays it on an [`AudioOutput`] and reports progress to the turn controller.
//! The clip is held in a [`PlaybackResource`] that is released exactly once,
//! whichever way playback ends.

mod decode;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt as _;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::session::{TurnEvent, TurnId};
use crate::{Error, Result};

pub use decode::decode_audio;

/// Decoded mono audio ready for an output device
#[derive(Debug, Clone)]
pub struct AudioClip {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioClip {
    #[must_use]
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Shared handle to the samples, for handing to a device thread
    #[must_use]
    pub fn shared_samples(&self) -> Arc<[f32]> {
        Arc::clone(&self.samples)
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playing time of the clip
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.samples.len() as u64 * 1000 / u64::from(self.sample_rate))
    }
}

/// Audio output capability
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Make a payload playable
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be decoded
    fn prepare(&self, payload: &[u8]) -> Result<AudioClip> {
        decode_audio(payload)
    }

    /// Play a clip, resolving once playback has finished
    ///
    /// # Errors
    ///
    /// Returns error if the device fails
    async fn play(&self, clip: &AudioClip) -> Result<()>;
}

/// Progress of one playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started,
    Ended,
    Failed(String),
}

#[derive(Debug, Default)]
struct Counts {
    allocated: AtomicUsize,
    released: AtomicUsize,
}

/// Counts playback resources as they are allocated and released
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    counts: Arc<Counts>,
}

impl ResourceTracker {
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.counts.allocated.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn released(&self) -> usize {
        self.counts.released.load(Ordering::Acquire)
    }

    /// Resources allocated but not yet released
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.allocated().saturating_sub(self.released())
    }
}

/// A prepared clip held for the duration of one playback
#[derive(Debug)]
pub struct PlaybackResource {
    clip: Option<AudioClip>,
    tracker: ResourceTracker,
}

impl PlaybackResource {
    /// Take ownership of a prepared clip
    #[must_use]
    pub fn acquire(clip: AudioClip, tracker: ResourceTracker) -> Self {
        tracker.counts.allocated.fetch_add(1, Ordering::AcqRel);
        Self {
            clip: Some(clip),
            tracker,
        }
    }

    /// The clip, until released
    #[must_use]
    pub const fn clip(&self) -> Option<&AudioClip> {
        self.clip.as_ref()
    }

    /// Free the clip; repeated calls do nothing
    pub fn release(&mut self) {
        if let Some(clip) = self.clip.take() {
            self.tracker.counts.released.fetch_add(1, Ordering::AcqRel);
            tracing::trace!(samples = clip.len(), "playback resource released");
        }
    }

    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.clip.is_none()
    }
}

impl Drop for PlaybackResource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Plays response payloads and reports progress as turn events
pub struct PlaybackController {
    output: Arc<dyn AudioOutput>,
    tracker: ResourceTracker,
}

impl PlaybackController {
    #[must_use]
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            tracker: ResourceTracker::default(),
        }
    }

    /// Resource accounting for this controller
    #[must_use]
    pub const fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// Play `payload` in the background
    ///
    /// Emits `Started` once the payload is prepared, then exactly one of
    /// `Ended` or `Failed`. A preparation failure emits only `Failed`.
    pub fn play(
        &self,
        turn: TurnId,
        payload: Vec<u8>,
        events: mpsc::UnboundedSender<TurnEvent>,
    ) -> JoinHandle<()> {
        let output = Arc::clone(&self.output);
        let tracker = self.tracker.clone();

        tokio::spawn(async move {
            let report = |event: PlaybackEvent| {
                if events.send(TurnEvent::Playback { turn, event }).is_err() {
                    tracing::trace!(turn, "turn controller gone, dropping playback event");
                }
            };

            let playback = run_playback(output.as_ref(), tracker, &payload, &report);
            let outcome = AssertUnwindSafe(playback).catch_unwind().await;

            let event = match outcome {
                Ok(Ok(())) => PlaybackEvent::Ended,
                Ok(Err(e)) => {
                    tracing::warn!(turn, error = %e, "playback failed");
                    PlaybackEvent::Failed(e.to_string())
                }
                Err(_) => {
                    tracing::error!(turn, "playback panicked");
                    PlaybackEvent::Failed("playback panicked".to_string())
                }
            };
            report(event);
        })
    }
}

async fn run_playback<F>(
    output: &dyn AudioOutput,
    tracker: ResourceTracker,
    payload: &[u8],
    report: &F,
) -> Result<()>
where
    F: Fn(PlaybackEvent) + Sync,
{
    let clip = output.prepare(payload)?;
    // Outputs overriding `prepare` skip the decoder's own empty check
    if clip.is_empty() {
        return Err(Error::Playback("audio payload contains no samples".to_string()));
    }

    tracing::debug!(
        samples = clip.len(),
        sample_rate = clip.sample_rate(),
        duration_ms = u64::try_from(clip.duration().as_millis()).unwrap_or(u64::MAX),
        "playing response"
    );

    let mut resource = PlaybackResource::acquire(clip, tracker);
    report(PlaybackEvent::Started);

    let result = match resource.clip() {
        Some(clip) => output.play(clip).await,
        None => Ok(()),
    };
    resource.release();
    result
}
