//! Microphone input
//!
//! The cpal callback downmixes each buffer to mono and pushes it over a
//! channel, so the reader pulls fixed-length blocks at its own pace.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// What the input callbacks hand to the reader
enum MicInput {
    Samples(Vec<f32>),
    Fault(String),
}

/// Open input stream on the default device
///
/// Not `Send`: open and read it on the same thread. Dropping it stops
/// capture.
pub struct Microphone {
    device_name: String,
    input: Receiver<MicInput>,
    _stream: Stream,
}

impl Microphone {
    /// Open the default input device and start capturing
    ///
    /// Prefers a mono config at [`SAMPLE_RATE`] and falls back to stereo,
    /// which is downmixed as it arrives.
    ///
    /// # Errors
    ///
    /// Returns error if no device is present or the stream cannot start
    pub fn open() -> Result<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;
        let device_name = device.name().unwrap_or_default();
        let config = input_config(&device)?;

        let (tx, input) = mpsc::channel();
        let stream = build_stream(&device, &config, tx)?;
        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = %device_name,
            sample_rate = SAMPLE_RATE,
            channels = config.channels,
            "microphone open"
        );

        Ok(Self {
            device_name,
            input,
            _stream: stream,
        })
    }

    /// Mono samples captured over the next `window`
    ///
    /// # Errors
    ///
    /// Returns error if the device reported a fault or the stream died
    pub fn read(&self, window: Duration) -> Result<Vec<f32>> {
        gather(&self.input, window)
    }

    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device_name, "microphone closed");
    }
}

fn input_config(device: &Device) -> Result<StreamConfig> {
    let supports = |c: &SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels
            && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
            && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
    };
    let find = |channels: u16| -> Result<Option<SupportedStreamConfigRange>> {
        Ok(device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| supports(c, channels)))
    };

    let range = match find(1)? {
        Some(mono) => mono,
        None => find(2)?
            .ok_or_else(|| Error::Audio("no 16 kHz input config found".to_string()))?,
    };
    Ok(range.with_sample_rate(SampleRate(SAMPLE_RATE)).config())
}

fn build_stream(device: &Device, config: &StreamConfig, tx: Sender<MicInput>) -> Result<Stream> {
    let channels = usize::from(config.channels.max(1));
    let fault_tx = tx.clone();

    device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let chunk = if channels == 1 {
                    data.to_vec()
                } else {
                    downmix(data, channels).collect()
                };
                // The reader is gone once the stream is being torn down
                let _ = tx.send(MicInput::Samples(chunk));
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                let _ = fault_tx.send(MicInput::Fault(err.to_string()));
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

/// Collect every chunk arriving before `window` runs out
fn gather(input: &Receiver<MicInput>, window: Duration) -> Result<Vec<f32>> {
    let deadline = Instant::now() + window;
    let mut block = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match input.recv_timeout(remaining) {
            Ok(MicInput::Samples(mut chunk)) => block.append(&mut chunk),
            Ok(MicInput::Fault(reason)) => return Err(Error::Audio(reason)),
            Err(RecvTimeoutError::Timeout) => return Ok(block),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::Audio("input stream closed".to_string()));
            }
        }
    }
}

/// Average interleaved frames down to mono
#[allow(clippy::cast_precision_loss)]
fn downmix(data: &[f32], channels: usize) -> impl Iterator<Item = f32> + '_ {
    data.chunks(channels)
        .map(move |frame| frame.iter().sum::<f32>() / frame.len() as f32)
}

/// Encode mono samples as 16-bit PCM WAV for upload
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let encode_err = |e: hound::Error| Error::Audio(format!("WAV encoding failed: {e}"));

    let mut wav = std::io::Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    let mut writer = hound::WavWriter::new(&mut wav, spec).map_err(encode_err)?;
    for &sample in samples {
        writer.write_sample(to_pcm16(sample)).map_err(encode_err)?;
    }
    writer.finalize().map_err(encode_err)?;

    Ok(wav.into_inner())
}

#[allow(clippy::cast_possible_truncation)]
fn to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo() {
        let stereo = [0.5, -0.5, 1.0, 0.0, 0.2, 0.4];
        let mono: Vec<f32> = downmix(&stereo, 2).collect();
        assert_eq!(mono.len(), 3);
        assert!(mono[0].abs() < 1e-6);
        assert!((mono[1] - 0.5).abs() < 1e-6);
        assert!((mono[2] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_gather_joins_chunks_in_order() {
        let (tx, rx) = mpsc::channel();
        tx.send(MicInput::Samples(vec![0.1, 0.2])).unwrap();
        tx.send(MicInput::Samples(vec![0.3])).unwrap();

        let block = gather(&rx, Duration::from_millis(20)).unwrap();
        assert_eq!(block, vec![0.1, 0.2, 0.3]);

        assert!(gather(&rx, Duration::from_millis(5)).unwrap().is_empty());
    }

    #[test]
    fn test_gather_surfaces_device_fault() {
        let (tx, rx) = mpsc::channel();
        tx.send(MicInput::Samples(vec![0.1])).unwrap();
        tx.send(MicInput::Fault("device unplugged".to_string())).unwrap();

        let err = gather(&rx, Duration::from_millis(20)).unwrap_err();
        assert!(err.to_string().contains("device unplugged"));

        drop(tx);
        assert!(gather(&rx, Duration::from_millis(20)).is_err());
    }

    #[test]
    fn test_samples_to_wav_clamps() {
        let wav = samples_to_wav(&[0.0, 2.0, -2.0], SAMPLE_RATE).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 3 * 2);

        let mut reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, i16::MAX, -i16::MAX]);
    }
}
