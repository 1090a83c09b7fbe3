//! Recognition session manager.
//!
//! Owns the lifecycle of one streaming recognition session at a time:
//! frames go in, ordered partial/final events come out. Vendor results are
//! normalized into a single queue with a per-session monotonic sequence;
//! out-of-order vendor partials are dropped. Transient upstream failures
//! trigger bounded reconnects with exponential backoff while inbound frames
//! are buffered, and a new session id (with a fresh sequence) is published
//! once the upstream comes back.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use uuid::Uuid;

use lumina_config::RecognizerConfig;
use lumina_core::{AudioFrame, Error, RecognizerBackend, RecognizerEvent, Result, Transcript};

/// Lifecycle of the upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Active,
    Draining,
    Closed,
    Failed,
}

struct Reconnect {
    attempt: u32,
    next_retry_at: Instant,
    buffered: Vec<AudioFrame>,
}

/// Funnels frames into the vendor adapter and emits ordered events.
pub struct RecognitionManager {
    backend: Arc<dyn RecognizerBackend>,
    config: RecognizerConfig,
    state: SessionState,
    session_id: Option<String>,
    /// Outward sequence, strictly increasing per session.
    out_seq: u64,
    /// Last accepted vendor sequence, for the monotonicity filter.
    last_vendor_seq: Option<u64>,
    events: VecDeque<RecognizerEvent>,
    reconnect: Option<Reconnect>,
}

impl RecognitionManager {
    pub fn new(backend: Arc<dyn RecognizerBackend>, config: RecognizerConfig) -> Self {
        Self {
            backend,
            config,
            state: SessionState::Idle,
            session_id: None,
            out_seq: 0,
            last_vendor_seq: None,
            events: VecDeque::new(),
            reconnect: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Establish the upstream connection, bounded by the start timeout.
    pub async fn start_session(&mut self) -> Result<String> {
        if self.state == SessionState::Active {
            return Err(Error::Internal("session already active".into()));
        }

        self.state = SessionState::Starting;
        self.reconnect = None;

        let start = timeout(
            Duration::from_millis(self.config.session_start_timeout_ms),
            self.backend.start_session(),
        )
        .await;

        match start {
            Ok(Ok(())) => {
                let session_id = Uuid::new_v4().to_string();
                self.session_id = Some(session_id.clone());
                self.state = SessionState::Active;
                self.out_seq = 0;
                self.last_vendor_seq = None;
                self.backend.clear_sentence_buffer().await;
                self.events.push_back(RecognizerEvent::SessionStarted {
                    session_id: session_id.clone(),
                });
                tracing::info!(session_id = %session_id, "recognition session started");
                Ok(session_id)
            }
            Ok(Err(e)) => {
                self.state = SessionState::Failed;
                tracing::warn!(error = %e, "recognition session start failed");
                Err(e)
            }
            Err(_) => {
                self.state = SessionState::Failed;
                Err(Error::Timeout("recognition session start"))
            }
        }
    }

    /// Queue one frame toward the upstream. Non-blocking from the caller's
    /// point of view: failures are absorbed into the reconnect path and
    /// surfaced as events.
    pub async fn send_frame(&mut self, frame: &AudioFrame) {
        if self.state != SessionState::Active {
            tracing::debug!(state = ?self.state, "dropping frame, no active session");
            return;
        }

        if self.reconnect.is_some() {
            self.buffer_frame(frame.clone());
            self.try_reconnect().await;
            return;
        }

        match self.forward(frame).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, "upstream send failed, entering reconnect");
                self.reconnect = Some(Reconnect {
                    attempt: 1,
                    next_retry_at: Instant::now()
                        + Duration::from_millis(self.config.reconnect_backoff_ms),
                    buffered: vec![frame.clone()],
                });
            }
            Err(e) => self.fail(e),
        }
    }

    /// Queue a batch of frames, flushed in order.
    pub async fn send_frames(&mut self, frames: &[AudioFrame]) {
        for frame in frames {
            self.send_frame(frame).await;
        }
    }

    /// Request a drain; returns the last final if the upstream produces one
    /// within the drain timeout.
    pub async fn end_session(&mut self) -> Result<Option<Transcript>> {
        if self.state != SessionState::Active {
            return Ok(None);
        }
        self.state = SessionState::Draining;
        self.reconnect = None;

        let drained = timeout(
            Duration::from_millis(self.config.final_drain_timeout_ms),
            self.backend.end_session(),
        )
        .await;

        // Pick up sentences the upstream committed during the drain.
        for text in self.backend.poll_complete_sentences().await {
            self.out_seq += 1;
            self.events.push_back(RecognizerEvent::SentenceFinalized {
                text,
                sequence: self.out_seq,
            });
        }

        self.state = SessionState::Closed;
        self.events.push_back(RecognizerEvent::Closed);

        match drained {
            Ok(Ok(Some(transcript))) => {
                self.out_seq += 1;
                Ok(Some(Transcript::final_commit(transcript.text, self.out_seq)))
            }
            Ok(Ok(None)) => Ok(None),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "drain failed");
                Err(e)
            }
            Err(_) => {
                tracing::debug!("drain timed out without a final");
                Ok(None)
            }
        }
    }

    /// Tear down without draining. The audio was spurious or superseded.
    pub async fn abort(&mut self) {
        if !matches!(
            self.state,
            SessionState::Active | SessionState::Starting | SessionState::Draining
        ) {
            return;
        }
        self.reconnect = None;

        // Best effort close; the result is discarded.
        let _ = timeout(
            Duration::from_millis(self.config.final_drain_timeout_ms),
            self.backend.end_session(),
        )
        .await;
        self.backend.clear_sentence_buffer().await;

        self.state = SessionState::Closed;
        self.events.push_back(RecognizerEvent::Closed);
        tracing::debug!(session_id = ?self.session_id, "recognition session aborted");
    }

    /// Drain pending events in order.
    pub fn poll_events(&mut self) -> Vec<RecognizerEvent> {
        self.events.drain(..).collect()
    }

    async fn forward(&mut self, frame: &AudioFrame) -> Result<()> {
        let partial = self.backend.send_chunk(&frame.to_pcm_bytes()).await?;
        if let Some(transcript) = partial {
            self.accept_transcript(transcript);
        }
        for text in self.backend.poll_complete_sentences().await {
            self.out_seq += 1;
            self.events.push_back(RecognizerEvent::SentenceFinalized {
                text,
                sequence: self.out_seq,
            });
        }
        Ok(())
    }

    fn accept_transcript(&mut self, transcript: Transcript) {
        if let Some(last) = self.last_vendor_seq {
            if transcript.sequence <= last {
                tracing::debug!(
                    sequence = transcript.sequence,
                    last_accepted = last,
                    "dropping out-of-order vendor partial"
                );
                return;
            }
        }
        self.last_vendor_seq = Some(transcript.sequence);
        self.out_seq += 1;
        self.events
            .push_back(RecognizerEvent::PartialEmitted(Transcript {
                text: transcript.text,
                is_final: transcript.is_final,
                sequence: self.out_seq,
            }));
    }

    fn buffer_frame(&mut self, frame: AudioFrame) {
        let capacity = self.config.reconnect_buffer_frames;
        let overflowed = match self.reconnect.as_mut() {
            Some(rc) if rc.buffered.len() < capacity => {
                rc.buffered.push(frame);
                false
            }
            Some(_) => true,
            None => return,
        };
        if overflowed {
            self.fail(Error::TransientUpstream(
                "reconnect buffer overflow".into(),
            ));
        }
    }

    async fn try_reconnect(&mut self) {
        let (attempt, due) = match &self.reconnect {
            Some(rc) => (rc.attempt, rc.next_retry_at),
            None => return,
        };
        if Instant::now() < due {
            return;
        }

        tracing::info!(attempt, "attempting recognizer reconnect");
        let started = timeout(
            Duration::from_millis(self.config.session_start_timeout_ms),
            self.backend.start_session(),
        )
        .await;

        match started {
            Ok(Ok(())) => {
                // New session, new sequence.
                let session_id = Uuid::new_v4().to_string();
                self.session_id = Some(session_id.clone());
                self.out_seq = 0;
                self.last_vendor_seq = None;
                self.events.push_back(RecognizerEvent::SessionStarted {
                    session_id: session_id.clone(),
                });

                let buffered = self
                    .reconnect
                    .take()
                    .map(|rc| rc.buffered)
                    .unwrap_or_default();
                tracing::info!(
                    session_id = %session_id,
                    flushed = buffered.len(),
                    "recognizer reconnected, flushing buffered frames"
                );
                for frame in &buffered {
                    if self.reconnect.is_some() || self.state != SessionState::Active {
                        break;
                    }
                    if let Err(e) = self.forward(frame).await {
                        if e.is_retryable() {
                            self.reconnect = Some(Reconnect {
                                attempt: 1,
                                next_retry_at: Instant::now()
                                    + Duration::from_millis(self.config.reconnect_backoff_ms),
                                buffered: Vec::new(),
                            });
                        } else {
                            self.fail(e);
                        }
                    }
                }
            }
            _ => {
                if attempt >= self.config.max_reconnects {
                    self.fail(Error::TransientUpstream(format!(
                        "reconnect failed after {attempt} attempts"
                    )));
                } else {
                    let backoff = self.config.reconnect_backoff_ms << attempt;
                    if let Some(rc) = self.reconnect.as_mut() {
                        rc.attempt = attempt + 1;
                        rc.next_retry_at = Instant::now() + Duration::from_millis(backoff);
                    }
                    tracing::warn!(
                        attempt,
                        next_backoff_ms = backoff,
                        "recognizer reconnect attempt failed"
                    );
                }
            }
        }
    }

    fn fail(&mut self, error: Error) {
        tracing::error!(error = %error, "recognition session failed terminally");
        self.state = SessionState::Failed;
        self.reconnect = None;
        self.events.push_back(RecognizerEvent::Error {
            message: error.to_string(),
            terminal: true,
        });
        self.events.push_back(RecognizerEvent::Closed);
    }
}
