//! Energy-based utterance segmentation
//!
//! Splits a microphone stream into utterances: speech followed by a short
//! stretch of silence.

use crate::voice::SAMPLE_RATE;

/// Minimum audio energy threshold to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum duration of speech to count as an utterance (in samples at 16kHz)
const MIN_SPEECH_SAMPLES: usize = SAMPLE_RATE as usize * 3 / 10; // 0.3 seconds

/// Silence duration to consider end of utterance (in samples)
const SILENCE_SAMPLES: usize = SAMPLE_RATE as usize / 2; // 0.5 seconds

/// Outcome of feeding one chunk to the segmenter
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    /// No utterance in progress
    Silence,
    /// An utterance is in progress and the chunk carried speech
    Speaking,
    /// An utterance just ended
    Complete(Vec<f32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    InUtterance,
}

/// Detects utterance boundaries in audio
#[derive(Debug)]
pub struct UtteranceSegmenter {
    state: State,
    speech_buffer: Vec<f32>,
    voiced_samples: usize,
    silence_counter: usize,
}

impl Default for UtteranceSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl UtteranceSegmenter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: State::Idle,
            speech_buffer: Vec::new(),
            voiced_samples: 0,
            silence_counter: 0,
        }
    }

    /// Feed captured samples
    pub fn push(&mut self, samples: &[f32]) -> SegmentEvent {
        let energy = calculate_energy(samples);
        let is_speech = energy > ENERGY_THRESHOLD;

        match self.state {
            State::Idle => {
                if !is_speech {
                    return SegmentEvent::Silence;
                }
                self.state = State::InUtterance;
                self.speech_buffer.clear();
                self.speech_buffer.extend_from_slice(samples);
                self.voiced_samples = samples.len();
                self.silence_counter = 0;
                tracing::trace!(energy, "speech detected");
                SegmentEvent::Speaking
            }
            State::InUtterance => {
                self.speech_buffer.extend_from_slice(samples);

                if is_speech {
                    self.voiced_samples += samples.len();
                    self.silence_counter = 0;
                    return SegmentEvent::Speaking;
                }
                self.silence_counter += samples.len();

                if self.silence_counter > SILENCE_SAMPLES
                    && self.voiced_samples > MIN_SPEECH_SAMPLES
                {
                    tracing::debug!(samples = self.speech_buffer.len(), "utterance complete");
                    let utterance = std::mem::take(&mut self.speech_buffer);
                    self.reset();
                    return SegmentEvent::Complete(utterance);
                }

                // Too much silence without enough speech: a click or a cough
                if self.silence_counter > SILENCE_SAMPLES * 2 {
                    tracing::trace!("discarding short noise burst");
                    self.reset();
                    return SegmentEvent::Silence;
                }

                SegmentEvent::Silence
            }
        }
    }

    /// Whether an utterance is being accumulated
    #[must_use]
    pub fn in_utterance(&self) -> bool {
        self.state == State::InUtterance
    }

    /// Drop any partial utterance
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.speech_buffer.clear();
        self.voiced_samples = 0;
        self.silence_counter = 0;
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
