//! Frame classifier.
//!
//! Tags each inbound frame as voice or silence and tracks how long the
//! current silence run has lasted. The voice decision itself is external:
//! frames arriving pre-classified pass through untouched, and only
//! `Unknown` frames fall back to the server-side energy gate.

use lumina_config::ClassifierConfig;
use lumina_core::{AudioFrame, Classification, FrameClassification};

/// Per-session frame classifier.
///
/// Stateless across sessions: a session boundary resets the silence counter.
pub struct FrameClassifier {
    config: ClassifierConfig,
    contiguous_silence_ms: u32,
}

impl FrameClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            contiguous_silence_ms: 0,
        }
    }

    /// Classify one frame and update the silence counter.
    pub fn classify(&mut self, frame: &AudioFrame) -> FrameClassification {
        let is_voice = match frame.classification {
            Classification::Voice => true,
            Classification::Silence => false,
            Classification::Unknown => frame.energy_db() > self.config.energy_floor_db,
        };

        if is_voice {
            self.contiguous_silence_ms = 0;
            FrameClassification::voice()
        } else {
            self.contiguous_silence_ms = self
                .contiguous_silence_ms
                .saturating_add(frame.duration_ms());
            FrameClassification::silence(self.contiguous_silence_ms)
        }
    }

    /// Seed the silence counter from a client-reported duration.
    ///
    /// Clients running their own voice activity detection report contiguous
    /// silence out-of-band; the larger of the two observations wins.
    pub fn observe_client_silence(&mut self, silence_ms: u32) {
        self.contiguous_silence_ms = self.contiguous_silence_ms.max(silence_ms);
    }

    /// Current contiguous silence duration.
    pub fn contiguous_silence_ms(&self) -> u32 {
        self.contiguous_silence_ms
    }

    /// Session boundary: forget the silence run.
    pub fn reset(&mut self) {
        self.contiguous_silence_ms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumina_core::FRAME_MS;

    fn voice_frame(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![8000; 320], seq, Classification::Voice)
    }

    fn silence_frame(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0; 320], seq, Classification::Silence)
    }

    fn unknown_frame(seq: u64, amplitude: i16) -> AudioFrame {
        AudioFrame::new(vec![amplitude; 320], seq, Classification::Unknown)
    }

    #[test]
    fn test_silence_accumulates_per_frame() {
        let mut classifier = FrameClassifier::new(ClassifierConfig::default());

        for i in 0..5 {
            let cls = classifier.classify(&silence_frame(i));
            assert!(!cls.is_voice);
            assert_eq!(cls.contiguous_silence_ms, (i as u32 + 1) * FRAME_MS);
        }
    }

    #[test]
    fn test_voice_resets_counter() {
        let mut classifier = FrameClassifier::new(ClassifierConfig::default());

        classifier.classify(&silence_frame(0));
        classifier.classify(&silence_frame(1));
        assert_eq!(classifier.contiguous_silence_ms(), 2 * FRAME_MS);

        let cls = classifier.classify(&voice_frame(2));
        assert!(cls.is_voice);
        assert_eq!(cls.contiguous_silence_ms, 0);
        assert_eq!(classifier.contiguous_silence_ms(), 0);
    }

    #[test]
    fn test_unknown_frames_use_energy_gate() {
        let mut classifier = FrameClassifier::new(ClassifierConfig::default());

        // Loud unknown frame counts as voice.
        let cls = classifier.classify(&unknown_frame(0, 12000));
        assert!(cls.is_voice);

        // Near-silent unknown frame counts as silence.
        let cls = classifier.classify(&unknown_frame(1, 3));
        assert!(!cls.is_voice);
    }

    #[test]
    fn test_client_silence_observation_seeds_counter() {
        let mut classifier = FrameClassifier::new(ClassifierConfig::default());

        classifier.observe_client_silence(300);
        assert_eq!(classifier.contiguous_silence_ms(), 300);

        // A smaller server-side run does not shrink the observation.
        let cls = classifier.classify(&silence_frame(0));
        assert_eq!(cls.contiguous_silence_ms, 300 + FRAME_MS);

        // Voice clears it like any other silence run.
        classifier.classify(&voice_frame(1));
        assert_eq!(classifier.contiguous_silence_ms(), 0);
    }

    #[test]
    fn test_reset_clears_counter() {
        let mut classifier = FrameClassifier::new(ClassifierConfig::default());
        classifier.classify(&silence_frame(0));
        classifier.reset();
        assert_eq!(classifier.contiguous_silence_ms(), 0);
    }
}
