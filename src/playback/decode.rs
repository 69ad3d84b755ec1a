//! Audio payload decoding (MP3 or WAV)

use std::io::Cursor;

use super::AudioClip;
use crate::{Error, Result};

/// Sample rate assumed when an MP3 stream carries no frames with a rate
const FALLBACK_SAMPLE_RATE: u32 = 24000;

/// Decode a response payload to mono samples
///
/// WAV is recognised by its RIFF header, everything else is treated as MP3.
///
/// # Errors
///
/// Returns error if the payload is empty or cannot be decoded
pub fn decode_audio(payload: &[u8]) -> Result<AudioClip> {
    if payload.is_empty() {
        return Err(Error::Playback("empty audio payload".to_string()));
    }

    let clip = if payload.starts_with(b"RIFF") {
        decode_wav(payload)?
    } else {
        decode_mp3(payload)?
    };

    if clip.is_empty() {
        return Err(Error::Playback("audio payload contains no samples".to_string()));
    }

    Ok(clip)
}

/// Decode WAV bytes to f32 samples
fn decode_wav(data: &[u8]) -> Result<AudioClip> {
    let reader = hound::WavReader::new(Cursor::new(data))
        .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?,
        hound::SampleFormat::Int => {
            #[allow(clippy::cast_precision_loss)]
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| {
                    #[allow(clippy::cast_precision_loss)]
                    s.map(|v| v as f32 / scale)
                })
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?
        }
    };

    Ok(AudioClip::new(to_mono(&interleaved, channels), spec.sample_rate))
}

/// Decode MP3 bytes to f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<AudioClip> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = None;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if sample_rate.is_none() {
                    sample_rate = u32::try_from(frame.sample_rate).ok();
                }

                let frame_samples: Vec<f32> =
                    frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(to_mono(&frame_samples, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(AudioClip::new(
        samples,
        sample_rate.unwrap_or(FALLBACK_SAMPLE_RATE),
    ))
}

/// Average interleaved channels
#[allow(clippy::cast_precision_loss)]
fn to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::{SAMPLE_RATE, samples_to_wav};

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(decode_audio(&[]), Err(Error::Playback(_))));
    }

    #[test]
    fn test_decodes_wav() {
        let wav = samples_to_wav(&[0.0, 0.5, -0.5, 0.25], SAMPLE_RATE).unwrap();
        let clip = decode_audio(&wav).unwrap();

        assert_eq!(clip.sample_rate(), SAMPLE_RATE);
        assert_eq!(clip.len(), 4);
        assert!((clip.samples()[1] - 0.5).abs() < 1e-3);
        assert!((clip.samples()[2] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_stereo_wav_downmixed() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in [16384_i16, 0, 16384, 16384] {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }

        let clip = decode_audio(&cursor.into_inner()).unwrap();
        assert_eq!(clip.sample_rate(), 22050);
        assert_eq!(clip.len(), 2);
        assert!((clip.samples()[0] - 0.25).abs() < 1e-3);
        assert!((clip.samples()[1] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_garbage_payload_rejected() {
        assert!(decode_audio(b"definitely not audio").is_err());
    }
}
