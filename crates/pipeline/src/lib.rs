//! The Lumina dialogue core.
//!
//! This crate couples three asynchronous streams (microphone frames,
//! recognizer events, and synthesized audio) under one turn-taking
//! authority:
//! - Frame classification with a running silence counter
//! - The five-phase turn state machine
//! - Pre-roll buffering so the recognizer sees utterance onsets
//! - Recognition session lifecycle with bounded reconnects
//! - Sentence aggregation with a fragment merge window
//! - Reply orchestration (language model -> synthesizer -> playback)
//! - Barge-in cancellation with a single transport-boundary choke point

pub mod adapters;
pub mod barge_in;
pub mod classifier;
pub mod engine;
pub mod orchestrator;
pub mod preroll;
pub mod recognizer;
pub mod sentences;
pub mod turn;

pub use barge_in::BargeInCoordinator;
pub use classifier::FrameClassifier;
pub use engine::DialogueEngine;
pub use orchestrator::{DialogueOrchestrator, ReplySlot};
pub use preroll::PreRollRing;
pub use recognizer::{RecognitionManager, SessionState};
pub use sentences::SentenceAggregator;
pub use turn::{TurnAction, TurnMachine};
