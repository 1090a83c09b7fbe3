//! Vendor adapter traits.
//!
//! The three remote services (recognizer, language model, synthesizer) and
//! the playback transport sit behind these seams. Vendor SDKs that deliver
//! results via callbacks on their own threads are wrapped so the thread hop
//! is paid once here; everything past the trait boundary is ordinary async.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::transcript::Transcript;

/// Streaming speech recognizer vendor.
///
/// Implementations hold one upstream connection at a time. Partials may be
/// empty strings (keep-alives); finals must not be.
#[async_trait]
pub trait RecognizerBackend: Send + Sync {
    /// Establish the upstream connection. Returns once the upstream has
    /// acknowledged readiness.
    async fn start_session(&self) -> Result<()>;

    /// Feed one chunk of PCM bytes; may return a fresh partial.
    async fn send_chunk(&self, pcm: &[u8]) -> Result<Option<Transcript>>;

    /// Request a drain. Returns the last final if the upstream produces one.
    async fn end_session(&self) -> Result<Option<Transcript>>;

    /// Sentences the upstream has committed since the last call.
    async fn poll_complete_sentences(&self) -> Vec<String>;

    /// Discard any committed-but-unconsumed sentences.
    async fn clear_sentence_buffer(&self);
}

/// One streamed chunk of language-model output. Always non-empty UTF-8.
pub type TextChunk = String;

/// Language model vendor.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a reply for `prompt`, streaming chunks into `tx`.
    ///
    /// The stream terminates when this returns (the sender is dropped).
    /// Implementations must stop between chunks once `cancel` fires.
    async fn generate(
        &self,
        prompt: &str,
        cancel: CancelToken,
        tx: mpsc::Sender<TextChunk>,
    ) -> Result<()>;
}

/// One streamed chunk of synthesized audio: 16 kHz mono PCM samples.
/// Never empty.
pub type AudioChunk = Vec<i16>;

/// Text-to-speech vendor.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Render `text`, streaming audio chunks into `tx`.
    ///
    /// The stream terminates when this returns. Implementations must stop
    /// between chunks once `cancel` fires.
    async fn synthesize(
        &self,
        text: &str,
        cancel: CancelToken,
        tx: mpsc::Sender<AudioChunk>,
    ) -> Result<()>;
}

/// The playback transport (server -> client).
///
/// This is the last point where a chunk of a cancelled reply can be dropped;
/// the orchestrator checks the reply's cancel token immediately before every
/// `send_chunk` call.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Forward one audio chunk toward the client, in production order.
    async fn send_chunk(&self, chunk: &[i16]) -> Result<()>;

    /// Signal normal end of the current reply.
    async fn end_of_reply(&self) -> Result<()>;

    /// Drop any buffered but unplayed audio (barge-in path).
    async fn drop_buffered(&self) -> Result<()>;
}
