//! Audio playback to speakers

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::playback::{AudioClip, AudioOutput};
use crate::{Error, Result};

/// Grace period after the last sample so the device drains its buffer
const DRAIN_DELAY: Duration = Duration::from_millis(100);

/// Plays clips on the default output device
pub struct SpeakerOutput {
    device_name: String,
}

impl SpeakerOutput {
    /// Create a new speaker output
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;
        let device_name = device.name().unwrap_or_default();

        tracing::debug!(device = %device_name, "audio playback initialized");
        Ok(Self { device_name })
    }

    /// Name of the output device
    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

#[async_trait]
impl AudioOutput for SpeakerOutput {
    async fn play(&self, clip: &AudioClip) -> Result<()> {
        let samples = clip.shared_samples();
        let sample_rate = clip.sample_rate();

        tokio::task::spawn_blocking(move || play_samples_blocking(&samples, sample_rate))
            .await
            .map_err(|e| Error::Playback(format!("playback task failed: {e}")))?
    }
}

/// Find a mono (or stereo) output config at `sample_rate`
fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let rate = SampleRate(sample_rate);
    let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
    };

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| supports(c, 1))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, 2))
        })
        .ok_or_else(|| {
            Error::Audio(format!("no output config supports {sample_rate} Hz"))
        })?;

    Ok(supported_config.with_sample_rate(rate).config())
}

/// Play samples, returning once they have been handed to the device
fn play_samples_blocking(samples: &Arc<[f32]>, sample_rate: u32) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;

    let config = output_config(&device, sample_rate)?;
    let channels = usize::from(config.channels);

    let position = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));
    let device_error = Arc::new(AtomicBool::new(false));

    let stream_samples = Arc::clone(samples);
    let stream_position = Arc::clone(&position);
    let stream_finished = Arc::clone(&finished);
    let stream_error = Arc::clone(&device_error);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut pos = stream_position.load(Ordering::Relaxed);

                for frame in data.chunks_mut(channels) {
                    let sample = stream_samples.get(pos).copied().unwrap_or_else(|| {
                        stream_finished.store(true, Ordering::Release);
                        0.0
                    });
                    frame.fill(sample);

                    if pos < stream_samples.len() {
                        pos += 1;
                    }
                }

                stream_position.store(pos, Ordering::Relaxed);
            },
            move |err| {
                tracing::error!(error = %err, "audio playback error");
                stream_error.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    // Poll for completion with timeout
    let duration_ms = (samples.len() as u64 * 1000) / u64::from(sample_rate.max(1));
    let timeout = Duration::from_millis(duration_ms + 500);
    let start = Instant::now();

    while !finished.load(Ordering::Acquire) {
        if device_error.load(Ordering::Acquire) {
            return Err(Error::Playback("output device reported an error".to_string()));
        }
        if start.elapsed() > timeout {
            tracing::warn!(duration_ms, "playback did not finish in time");
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    std::thread::sleep(DRAIN_DELAY);

    drop(stream);
    tracing::debug!(samples = samples.len(), "playback complete");

    Ok(())
}
