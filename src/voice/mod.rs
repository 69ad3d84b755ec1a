//! Native audio devices
//!
//! Microphone capture feeds the capture recognizer, speaker output plays
//! remote responses.

mod microphone;
mod playback;

pub use microphone::{Microphone, SAMPLE_RATE, samples_to_wav};
pub use playback::SpeakerOutput;
