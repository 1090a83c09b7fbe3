//! Core types and traits for the Lumina dialogue engine.
//!
//! This crate provides what every other crate shares:
//! - Audio frame types and PCM conversion
//! - Transcript, phase, and event types
//! - The in-process event bus
//! - Cooperative cancellation tokens
//! - The error taxonomy
//! - Vendor adapter traits (recognizer, language model, synthesizer, playback)

pub mod audio;
pub mod bus;
pub mod cancel;
pub mod error;
pub mod event;
pub mod phase;
pub mod traits;
pub mod transcript;

pub use audio::{
    AudioFrame, Classification, FrameClassification, BYTES_PER_FRAME, FRAME_MS, SAMPLES_PER_FRAME,
    SAMPLE_RATE,
};
pub use bus::{BusSubscriber, EventBus, DEFAULT_QUEUE_DEPTH};
pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use event::{BusEvent, ControlEvent, RecognizerEvent};
pub use phase::TurnPhase;
pub use traits::{
    AudioChunk, LanguageModel, PlaybackSink, RecognizerBackend, SpeechSynthesizer, TextChunk,
};
pub use transcript::Transcript;
