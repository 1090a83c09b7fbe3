//! Scripted vendor adapters.
//!
//! Deterministic stand-ins for the three remote vendors plus a recording
//! playback sink. Tests script what happens at which chunk; local
//! development gets a pipeline that runs without any vendor processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};

use lumina_core::{
    AudioChunk, CancelToken, Error, LanguageModel, PlaybackSink, RecognizerBackend, Result,
    SpeechSynthesizer, TextChunk, Transcript,
};

// =============================================================================
// Recognizer
// =============================================================================

struct RecognizerState {
    /// Chunks accepted in the current session.
    session_chunk_index: u64,
    /// Send attempts across all sessions, including failed ones.
    attempt_index: u64,
    /// Partial scripts keyed by per-session chunk index, consumed on fire.
    partials: HashMap<u64, (String, Option<u64>)>,
    /// Sentence scripts keyed by per-session chunk index, consumed on fire.
    sentences: HashMap<u64, String>,
    /// Attempt indices that fail once with a transient error.
    fail_attempts: Vec<u64>,
    refuse_restarts: bool,
    sessions_started: usize,
    /// Byte length of every accepted chunk, in arrival order.
    received: Vec<usize>,
    /// First decoded sample of every accepted chunk, in arrival order.
    first_samples: Vec<i16>,
    vendor_seq: u64,
    pending_sentences: Vec<String>,
    final_on_end: Option<String>,
}

/// A recognizer whose behavior is scripted per received chunk.
pub struct ScriptedRecognizer {
    state: Mutex<RecognizerState>,
}

impl ScriptedRecognizer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RecognizerState {
                session_chunk_index: 0,
                attempt_index: 0,
                partials: HashMap::new(),
                sentences: HashMap::new(),
                fail_attempts: Vec::new(),
                refuse_restarts: false,
                sessions_started: 0,
                received: Vec::new(),
                first_samples: Vec::new(),
                vendor_seq: 0,
                pending_sentences: Vec::new(),
                final_on_end: None,
            }),
        }
    }

    /// Emit a partial when the nth chunk of the current session arrives.
    pub fn partial_at(&self, chunk_index: u64, text: &str) {
        self.state
            .lock()
            .partials
            .insert(chunk_index, (text.to_string(), None));
    }

    /// Emit a partial with an explicit vendor sequence.
    pub fn partial_with_sequence_at(&self, chunk_index: u64, text: &str, sequence: u64) {
        self.state
            .lock()
            .partials
            .insert(chunk_index, (text.to_string(), Some(sequence)));
    }

    /// Commit a sentence when the nth chunk of the current session arrives.
    pub fn sentence_at(&self, chunk_index: u64, text: &str) {
        self.state
            .lock()
            .sentences
            .insert(chunk_index, text.to_string());
    }

    /// Fail the nth send attempt (counted across sessions) once.
    pub fn fail_at(&self, attempt_index: u64) {
        self.state.lock().fail_attempts.push(attempt_index);
    }

    /// Make every session start after the first one fail.
    pub fn refuse_restarts(&self) {
        self.state.lock().refuse_restarts = true;
    }

    /// Produce this final transcript when the session is drained.
    pub fn final_on_end(&self, text: &str) {
        self.state.lock().final_on_end = Some(text.to_string());
    }

    pub fn chunks_received(&self) -> usize {
        self.state.lock().received.len()
    }

    pub fn received_frame_lengths(&self) -> Vec<usize> {
        self.state.lock().received.clone()
    }

    /// The first decoded sample of each accepted chunk. Tests encode a
    /// frame's identity there to check upstream ordering.
    pub fn received_first_samples(&self) -> Vec<i16> {
        self.state.lock().first_samples.clone()
    }

    pub fn sessions_started(&self) -> usize {
        self.state.lock().sessions_started
    }
}

impl Default for ScriptedRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecognizerBackend for ScriptedRecognizer {
    async fn start_session(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.refuse_restarts && state.sessions_started >= 1 {
            return Err(Error::TransientUpstream("scripted restart refusal".into()));
        }
        state.sessions_started += 1;
        state.session_chunk_index = 0;
        state.vendor_seq = 0;
        Ok(())
    }

    async fn send_chunk(&self, pcm: &[u8]) -> Result<Option<Transcript>> {
        let mut state = self.state.lock();

        let attempt = state.attempt_index;
        state.attempt_index += 1;
        if let Some(pos) = state.fail_attempts.iter().position(|&a| a == attempt) {
            state.fail_attempts.remove(pos);
            return Err(Error::TransientUpstream("scripted disconnect".into()));
        }

        let index = state.session_chunk_index;
        state.session_chunk_index += 1;
        state.received.push(pcm.len());
        let first = if pcm.len() >= 2 {
            i16::from_le_bytes([pcm[0], pcm[1]])
        } else {
            0
        };
        state.first_samples.push(first);

        if let Some(text) = state.sentences.remove(&index) {
            state.pending_sentences.push(text);
        }

        if let Some((text, seq_override)) = state.partials.remove(&index) {
            let sequence = seq_override.unwrap_or(state.vendor_seq + 1);
            state.vendor_seq = sequence;
            return Ok(Some(Transcript::partial(text, sequence)));
        }

        Ok(None)
    }

    async fn end_session(&self) -> Result<Option<Transcript>> {
        let mut state = self.state.lock();
        let sequence = state.vendor_seq + 1;
        state.vendor_seq = sequence;
        Ok(state
            .final_on_end
            .take()
            .map(|text| Transcript::final_commit(text, sequence)))
    }

    async fn poll_complete_sentences(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().pending_sentences)
    }

    async fn clear_sentence_buffer(&self) {
        self.state.lock().pending_sentences.clear();
    }
}

// =============================================================================
// Language model
// =============================================================================

/// A language model that replays a fixed chunk script.
pub struct ScriptedLanguageModel {
    chunks: Vec<String>,
    chunk_delay: Duration,
    fail: bool,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLanguageModel {
    pub fn with_reply(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|s| s.to_string()).collect(),
            chunk_delay: Duration::ZERO,
            fail: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            chunks: Vec::new(),
            chunk_delay: Duration::ZERO,
            fail: true,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Prompts this model was asked to answer.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLanguageModel {
    async fn generate(
        &self,
        prompt: &str,
        cancel: CancelToken,
        tx: mpsc::Sender<TextChunk>,
    ) -> Result<()> {
        self.prompts.lock().push(prompt.to_string());

        if self.fail {
            return Err(Error::PermanentUpstream("scripted model failure".into()));
        }

        for chunk in &self.chunks {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            if tx.send(chunk.clone()).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Synthesizer
// =============================================================================

/// Where a scripted synthesis failure strikes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthFailure {
    /// Fail before any audio is produced.
    OnFirstChunk,
    /// Produce one chunk, then fail.
    AfterFirstChunk,
}

/// A synthesizer emitting silence chunks, one batch per text submission.
pub struct ScriptedSynthesizer {
    chunks_per_text: usize,
    samples_per_chunk: usize,
    chunk_delay: Duration,
    failure: Option<SynthFailure>,
    texts: Mutex<Vec<String>>,
}

impl ScriptedSynthesizer {
    pub fn new(chunks_per_text: usize) -> Self {
        Self {
            chunks_per_text,
            samples_per_chunk: 320,
            chunk_delay: Duration::ZERO,
            failure: None,
            texts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failure(mut self, failure: SynthFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Texts submitted for synthesis.
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        cancel: CancelToken,
        tx: mpsc::Sender<AudioChunk>,
    ) -> Result<()> {
        self.texts.lock().push(text.to_string());

        if self.failure == Some(SynthFailure::OnFirstChunk) {
            return Err(Error::PermanentUpstream("scripted synthesis failure".into()));
        }

        for produced in 0..self.chunks_per_text {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            if tx.send(vec![0i16; self.samples_per_chunk]).await.is_err() {
                break;
            }
            if produced == 0 && self.failure == Some(SynthFailure::AfterFirstChunk) {
                return Err(Error::TransientUpstream(
                    "scripted mid-stream synthesis failure".into(),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Playback sink
// =============================================================================

/// Records everything that reaches the playback egress.
///
/// With `pause_after(n)`, the sink blocks once `n` chunks have played so a
/// test can fire a barge-in while a chunk sits in the transport buffer; a
/// subsequent `drop_buffered` releases the blocked chunk without playing it.
pub struct RecordingPlayback {
    played: Mutex<Vec<Vec<i16>>>,
    end_count: AtomicUsize,
    drop_count: AtomicUsize,
    pause_after: Option<usize>,
    blocked_tx: watch::Sender<bool>,
    blocked_rx: watch::Receiver<bool>,
    resume: Notify,
    dropped_while_blocked: AtomicBool,
}

impl RecordingPlayback {
    pub fn new() -> Self {
        let (blocked_tx, blocked_rx) = watch::channel(false);
        Self {
            played: Mutex::new(Vec::new()),
            end_count: AtomicUsize::new(0),
            drop_count: AtomicUsize::new(0),
            pause_after: None,
            blocked_tx,
            blocked_rx,
            resume: Notify::new(),
            dropped_while_blocked: AtomicBool::new(false),
        }
    }

    pub fn pause_after(mut self, played_chunks: usize) -> Self {
        self.pause_after = Some(played_chunks);
        self
    }

    /// Wait until a send is blocked at the pause gate.
    pub async fn wait_until_blocked(&self) {
        let mut rx = self.blocked_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn played_chunks(&self) -> usize {
        self.played.lock().len()
    }

    pub fn ends(&self) -> usize {
        self.end_count.load(Ordering::SeqCst)
    }

    pub fn drops(&self) -> usize {
        self.drop_count.load(Ordering::SeqCst)
    }
}

impl Default for RecordingPlayback {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlaybackSink for RecordingPlayback {
    async fn send_chunk(&self, chunk: &[i16]) -> Result<()> {
        if let Some(limit) = self.pause_after {
            if self.played.lock().len() >= limit {
                let _ = self.blocked_tx.send(true);
                self.resume.notified().await;
                let _ = self.blocked_tx.send(false);
                if self.dropped_while_blocked.swap(false, Ordering::SeqCst) {
                    // The chunk sat in the transport buffer and was dropped
                    // before it could play.
                    return Ok(());
                }
            }
        }
        self.played.lock().push(chunk.to_vec());
        Ok(())
    }

    async fn end_of_reply(&self) -> Result<()> {
        self.end_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn drop_buffered(&self) -> Result<()> {
        self.drop_count.fetch_add(1, Ordering::SeqCst);
        self.dropped_while_blocked.store(true, Ordering::SeqCst);
        self.resume.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_recognizer_consumes_scripts() {
        let rec = ScriptedRecognizer::new();
        rec.partial_at(0, "hi");
        rec.start_session().await.unwrap();

        let first = rec.send_chunk(&[0u8; 4]).await.unwrap();
        assert_eq!(first.unwrap().text, "hi");
        let second = rec.send_chunk(&[0u8; 4]).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_scripted_model_streams_chunks() {
        let model = ScriptedLanguageModel::with_reply(&["Hello ", "there."]);
        let (tx, mut rx) = mpsc::channel(8);

        model
            .generate("hi", CancelToken::new(), tx)
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), "Hello ");
        assert_eq!(rx.recv().await.unwrap(), "there.");
        assert!(rx.recv().await.is_none());
        assert_eq!(model.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_model_honors_cancel() {
        let model = ScriptedLanguageModel::with_reply(&["a", "b", "c"]);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = model.generate("hi", cancel, tx).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recording_playback_counts() {
        let playback = RecordingPlayback::new();
        playback.send_chunk(&[1, 2, 3]).await.unwrap();
        playback.end_of_reply().await.unwrap();

        assert_eq!(playback.played_chunks(), 1);
        assert_eq!(playback.ends(), 1);
        assert_eq!(playback.drops(), 0);
    }

    #[tokio::test]
    async fn test_pause_gate_drops_blocked_chunk() {
        let playback = std::sync::Arc::new(RecordingPlayback::new().pause_after(1));

        playback.send_chunk(&[1]).await.unwrap();

        let blocked = playback.clone();
        let handle = tokio::spawn(async move { blocked.send_chunk(&[2]).await });

        playback.wait_until_blocked().await;
        playback.drop_buffered().await.unwrap();

        handle.await.unwrap().unwrap();
        assert_eq!(playback.played_chunks(), 1);
    }
}
