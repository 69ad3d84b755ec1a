//! Transcript accumulation for the current utterance

use crate::recognition::RecognitionResult;

/// Recognized text of the current Listening phase
///
/// Rebuilt from the full result list on every delivery rather than appended
/// to, so platforms that redeliver overlapping result ranges cannot
/// duplicate text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptAccumulator {
    finalized: String,
    interim: String,
    deliveries: usize,
}

impl TranscriptAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-derive finalized and interim text from the complete result list
    pub fn rebuild(&mut self, results: &[RecognitionResult]) {
        self.finalized.clear();
        self.interim.clear();

        for result in results {
            if result.is_final {
                self.finalized.push_str(&result.transcript);
            } else {
                self.interim.push_str(&result.transcript);
            }
        }
        self.deliveries += 1;
    }

    /// Forget everything, ready for a new Listening phase
    pub fn clear(&mut self) {
        self.finalized.clear();
        self.interim.clear();
        self.deliveries = 0;
    }

    /// Concatenated final segments
    #[must_use]
    pub fn finalized(&self) -> &str {
        &self.finalized
    }

    /// Concatenated interim segments of the latest delivery
    #[must_use]
    pub fn interim(&self) -> &str {
        &self.interim
    }

    /// Finalized text with surrounding whitespace removed
    #[must_use]
    pub fn trimmed(&self) -> &str {
        self.finalized.trim()
    }

    /// Whether any results arrived since the last clear
    #[must_use]
    pub const fn has_deliveries(&self) -> bool {
        self.deliveries > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fin(text: &str) -> RecognitionResult {
        RecognitionResult::final_text(text)
    }

    fn interim(text: &str) -> RecognitionResult {
        RecognitionResult::interim(text)
    }

    #[test]
    fn test_only_finals_accumulate() {
        let mut transcript = TranscriptAccumulator::new();

        transcript.rebuild(&[interim("o")]);
        assert_eq!(transcript.finalized(), "");
        assert_eq!(transcript.interim(), "o");

        transcript.rebuild(&[interim("oi tu")]);
        transcript.rebuild(&[fin("oi tudo bem"), interim(" com")]);
        transcript.rebuild(&[fin("oi tudo bem"), interim(" como vai"), interim(" vo")]);
        transcript.rebuild(&[fin("oi tudo bem"), fin(" como vai você")]);

        assert_eq!(transcript.finalized(), "oi tudo bem como vai você");
        assert_eq!(transcript.interim(), "");
    }

    #[test]
    fn test_redelivery_does_not_duplicate() {
        let mut transcript = TranscriptAccumulator::new();
        let results = [fin("bom dia"), fin(" tudo certo")];

        transcript.rebuild(&results);
        transcript.rebuild(&results);
        transcript.rebuild(&results[..1]);
        transcript.rebuild(&results);

        assert_eq!(transcript.finalized(), "bom dia tudo certo");
    }

    #[test]
    fn test_interim_noise_is_ignored_regardless_of_order() {
        let finals = [fin("a"), fin(" b"), fin(" c")];
        let noise = [interim("x"), interim("yy"), interim("zzz")];

        let mut forward = TranscriptAccumulator::new();
        let mut list: Vec<RecognitionResult> = finals.to_vec();
        list.extend(noise.iter().cloned());
        forward.rebuild(&list);

        let mut reversed = TranscriptAccumulator::new();
        let mut list: Vec<RecognitionResult> = finals.to_vec();
        list.extend(noise.iter().rev().cloned());
        reversed.rebuild(&list);

        assert_eq!(forward.finalized(), "a b c");
        assert_eq!(forward.finalized(), reversed.finalized());
    }

    #[test]
    fn test_trim_and_clear() {
        let mut transcript = TranscriptAccumulator::new();
        assert!(!transcript.has_deliveries());

        transcript.rebuild(&[fin("   "), interim("hmm")]);
        assert_eq!(transcript.trimmed(), "");
        assert!(transcript.has_deliveries());

        transcript.rebuild(&[fin("  oi  ")]);
        assert_eq!(transcript.trimmed(), "oi");

        transcript.clear();
        assert_eq!(transcript.finalized(), "");
        assert!(!transcript.has_deliveries());
    }
}
