//! Audio frame types and PCM conversion.
//!
//! The canonical frame shape is 20 ms of 16 kHz mono audio: 320 signed
//! 16-bit little-endian samples, 640 bytes on the wire.

use std::sync::Arc;
use std::time::Instant;

/// Capture sample rate (Hz).
pub const SAMPLE_RATE: u32 = 16_000;

/// Frame duration (ms).
pub const FRAME_MS: u32 = 20;

/// Samples per frame at the canonical rate.
pub const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE as usize * FRAME_MS as usize) / 1000;

/// Bytes per frame (16-bit samples).
pub const BYTES_PER_FRAME: usize = SAMPLES_PER_FRAME * 2;

/// PCM16 normalization divisor for i16 -> f32.
pub const PCM16_NORMALIZE: f32 = 32768.0;

/// Voice/silence tag attached to a frame.
///
/// `Unknown` means the producer ran no voice activity decision; the frame
/// classifier resolves it with the server-side fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Classification {
    Voice,
    Silence,
    #[default]
    Unknown,
}

/// One fixed-duration block of captured audio.
///
/// Frames are immutable after construction; samples are shared so a frame can
/// be handed to the classifier, the pre-roll ring, and the recognizer without
/// copying.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM samples, `SAMPLES_PER_FRAME` long for canonical frames.
    pub samples: Arc<[i16]>,
    /// Capture-order sequence number, monotonic per connection.
    pub sequence: u64,
    /// Monotonic capture timestamp.
    pub captured_at: Instant,
    /// Voice activity tag supplied by the producer, if any.
    pub classification: Classification,
}

impl AudioFrame {
    /// Create a frame from raw samples.
    pub fn new(samples: Vec<i16>, sequence: u64, classification: Classification) -> Self {
        Self {
            samples: samples.into(),
            sequence,
            captured_at: Instant::now(),
            classification,
        }
    }

    /// Decode a frame from little-endian 16-bit PCM bytes.
    ///
    /// Trailing odd bytes are dropped. The frame is tagged `Unknown`.
    pub fn from_pcm_bytes(bytes: &[u8], sequence: u64) -> Self {
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(samples, sequence, Classification::Unknown)
    }

    /// Encode the frame back to little-endian 16-bit PCM bytes.
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for sample in self.samples.iter() {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }

    /// Frame duration in milliseconds, derived from the sample count.
    pub fn duration_ms(&self) -> u32 {
        (self.samples.len() as u32 * 1000) / SAMPLE_RATE
    }

    /// RMS energy in dBFS, used by the fallback voice activity decision.
    pub fn energy_db(&self) -> f32 {
        if self.samples.is_empty() {
            return f32::NEG_INFINITY;
        }
        let sum_sq: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let f = s as f64 / PCM16_NORMALIZE as f64;
                f * f
            })
            .sum();
        let rms = (sum_sq / self.samples.len() as f64).sqrt();
        if rms <= 0.0 {
            f32::NEG_INFINITY
        } else {
            (20.0 * rms.log10()) as f32
        }
    }
}

/// Classifier output for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameClassification {
    /// Whether the frame carried voice.
    pub is_voice: bool,
    /// Contiguous silence observed up to and including this frame.
    /// Always zero when `is_voice` is true.
    pub contiguous_silence_ms: u32,
}

impl FrameClassification {
    pub fn voice() -> Self {
        Self {
            is_voice: true,
            contiguous_silence_ms: 0,
        }
    }

    pub fn silence(contiguous_silence_ms: u32) -> Self {
        Self {
            is_voice: false,
            contiguous_silence_ms,
        }
    }
}
