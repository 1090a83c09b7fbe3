//! Event types carried on the in-process bus.

use serde::{Deserialize, Serialize};

use crate::audio::FrameClassification;
use crate::phase::TurnPhase;
use crate::transcript::Transcript;

/// Out-of-band commands from an operator, the UI, or the playback layer.
///
/// Handling is idempotent: a repeated `PlaybackStarted` while already
/// Listening has no additional effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlEvent {
    /// Force the machine back to Initial and cancel any reply.
    ResetToInitial,
    /// Same as reset, plus tear down the recognition session.
    ForceEndSession,
    /// The playback layer started rendering agent audio.
    PlaybackStarted,
    /// The playback layer finished rendering agent audio.
    PlaybackEnded,
    /// Explicit interrupt from the client.
    InterruptRequested,
}

/// Events produced by the recognition session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// A new upstream session is live.
    SessionStarted { session_id: String },
    /// A partial transcript arrived (may be empty).
    PartialEmitted(Transcript),
    /// A sentence was committed by the upstream.
    SentenceFinalized { text: String, sequence: u64 },
    /// The upstream failed; `terminal` means retries are exhausted.
    Error { message: String, terminal: bool },
    /// The session is closed and will emit nothing further.
    Closed,
}

/// The bus event sum type.
///
/// Everything components need to observe about each other flows through
/// these; no component holds a reference to another except through the bus
/// and the injected adapter handles.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// The classifier tagged an inbound frame.
    FrameClassified(FrameClassification),
    /// The turn phase changed (externally visible phases only).
    PhaseChanged { from: TurnPhase, to: TurnPhase },
    /// A partial transcript from the active session.
    PartialTranscript(Transcript),
    /// A finalized sentence, already sequence-checked.
    SentenceFinalized { text: String, sequence: u64 },
    /// A recognition session came up (fresh or after reconnect).
    RecognizerSessionStarted { session_id: String },
    /// The recognizer failed; `terminal` means the session is gone.
    RecognizerError { message: String, terminal: bool },
    /// The user spoke over agent playback.
    InterruptRequested,
    /// The barge-in coordinator cancelled the in-flight reply.
    InterruptAcknowledged,
    /// A reply task began work for one utterance.
    ReplyStarted { task_id: String, utterance: String },
    /// A reply task ended.
    ReplyFinished { task_id: String, cancelled: bool },
    /// A control command was injected.
    Control(ControlEvent),
    /// A slow subscriber dropped `missed` events.
    SubscriberLagged { missed: u64 },
}
