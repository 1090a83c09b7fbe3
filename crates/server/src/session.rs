//! Session management.
//!
//! One `DialogueSession` per conversation: it owns the engine task, the
//! orchestrator, the barge-in coordinator, and the playback buffer, and
//! exposes the channel endpoints the socket handlers feed. Tearing a
//! session down cascades to everything it spawned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use lumina_config::Settings;
use lumina_core::{
    CancelToken, ControlEvent, EventBus, LanguageModel, PlaybackSink, RecognizerBackend,
    SpeechSynthesizer, Transcript, TurnPhase,
};
use lumina_pipeline::adapters::{
    HttpLanguageModel, HttpLlmConfig, HttpRecognizer, HttpRecognizerConfig, HttpSynthesizer,
    HttpSynthesizerConfig,
};
use lumina_pipeline::engine::EngineCommand;
use lumina_pipeline::{
    BargeInCoordinator, DialogueEngine, DialogueOrchestrator, ReplySlot, SentenceAggregator,
};

use crate::playback::PlaybackChannel;
use crate::ServerError;

/// The vendor adapters one session talks to.
pub struct VendorAdapters {
    pub recognizer: Arc<dyn RecognizerBackend>,
    pub llm: Arc<dyn LanguageModel>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl VendorAdapters {
    /// Build the HTTP adapters from settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, ServerError> {
        let recognizer = HttpRecognizer::new(HttpRecognizerConfig::from_settings(
            &settings.recognizer,
        ))
        .map_err(|e| ServerError::Internal(e.to_string()))?;
        let llm = HttpLanguageModel::new(HttpLlmConfig::from_settings(&settings.llm))
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        let synthesizer = HttpSynthesizer::new(HttpSynthesizerConfig::from_settings(
            &settings.synthesizer,
        ))
        .map_err(|e| ServerError::Internal(e.to_string()))?;

        Ok(Self {
            recognizer: Arc::new(recognizer),
            llm: Arc::new(llm),
            synthesizer: Arc::new(synthesizer),
        })
    }
}

/// One live conversation.
pub struct DialogueSession {
    pub id: String,
    pub bus: EventBus,
    pub playback: Arc<PlaybackChannel>,
    /// Kept for readiness probes; the engine owns the session lifecycle.
    recognizer: Arc<dyn RecognizerBackend>,
    created_at: Instant,
    last_activity: RwLock<Instant>,
    active: RwLock<bool>,
    frame_tx: mpsc::Sender<EngineCommand>,
    control_tx: mpsc::Sender<ControlEvent>,
    phase_rx: watch::Receiver<TurnPhase>,
    shutdown: CancelToken,
}

impl DialogueSession {
    /// Wire up and spawn every task one conversation needs.
    pub fn spawn(id: impl Into<String>, settings: &Settings, adapters: VendorAdapters) -> Arc<Self> {
        let id = id.into();
        let bus = EventBus::new(settings.server.subscriber_queue_depth);
        let sentences = Arc::new(SentenceAggregator::new(
            settings.reply.sentence_merge_window_ms,
        ));
        let slot = ReplySlot::new();
        let playback = Arc::new(PlaybackChannel::new());
        let shutdown = CancelToken::new();

        let recognizer = adapters.recognizer.clone();
        let (engine, phase_rx) = DialogueEngine::new(
            settings,
            adapters.recognizer,
            sentences.clone(),
            bus.clone(),
            slot.clone(),
        );

        let orchestrator = DialogueOrchestrator::new(
            settings.reply.clone(),
            settings.llm.system_prompt.clone(),
            adapters.llm,
            adapters.synthesizer,
            playback.clone() as Arc<dyn PlaybackSink>,
            sentences,
            bus.clone(),
            phase_rx.clone(),
            slot.clone(),
        );

        let barge_in = BargeInCoordinator::new(
            bus.clone(),
            slot,
            playback.clone() as Arc<dyn PlaybackSink>,
        );

        let (frame_tx, frame_rx) = mpsc::channel(256);
        let (control_tx, control_rx) = mpsc::channel(32);

        tokio::spawn(engine.run(frame_rx, control_rx, shutdown.clone()));
        tokio::spawn(orchestrator.run(shutdown.clone()));
        tokio::spawn(barge_in.run(shutdown.clone()));

        tracing::info!(session_id = %id, "session spawned");
        Arc::new(Self {
            id,
            bus,
            playback,
            recognizer,
            created_at: Instant::now(),
            last_activity: RwLock::new(Instant::now()),
            active: RwLock::new(true),
            frame_tx,
            control_tx,
            phase_rx,
            shutdown,
        })
    }

    /// Forward one engine command from a transport.
    pub async fn send_command(&self, command: EngineCommand) -> Result<(), ServerError> {
        self.frame_tx
            .send(command)
            .await
            .map_err(|_| ServerError::Session("engine stopped".to_string()))
    }

    /// Inject a control event; these outrank frames in the engine.
    pub async fn send_control(&self, event: ControlEvent) -> Result<(), ServerError> {
        self.control_tx
            .send(event)
            .await
            .map_err(|_| ServerError::Session("engine stopped".to_string()))
    }

    /// Drain the recognizer and return the last final, if any.
    pub async fn stop_recognition(&self) -> Result<Option<Transcript>, ServerError> {
        let (respond_to, response) = oneshot::channel();
        self.send_command(EngineCommand::Stop { respond_to }).await?;
        response
            .await
            .map_err(|_| ServerError::Session("engine stopped".to_string()))
    }

    /// Probe the recognition stack: the vendor acknowledging a session
    /// start is the readiness signal the audio handshake reports.
    pub async fn recognizer_ready(&self) -> Result<(), ServerError> {
        self.recognizer
            .start_session()
            .await
            .map_err(|e| ServerError::Session(format!("recognizer not ready: {e}")))
    }

    /// The externally visible phase.
    pub fn phase(&self) -> TurnPhase {
        *self.phase_rx.borrow()
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.read().elapsed() > timeout
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_active(&self) -> bool {
        *self.active.read()
    }

    /// Stop every task this session spawned.
    pub fn close(&self) {
        let mut active = self.active.write();
        if *active {
            *active = false;
            self.shutdown.cancel();
            tracing::info!(session_id = %self.id, "session closed");
        }
    }
}

impl Drop for DialogueSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Holds live sessions and evicts idle ones.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<DialogueSession>>>,
    max_sessions: usize,
    session_timeout: Duration,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            session_timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_timeout(max_sessions: usize, session_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            session_timeout,
        }
    }

    pub fn create(
        &self,
        settings: &Settings,
        adapters: VendorAdapters,
    ) -> Result<Arc<DialogueSession>, ServerError> {
        let mut sessions = self.sessions.write();

        if sessions.len() >= self.max_sessions {
            self.cleanup_expired_internal(&mut sessions);
            if sessions.len() >= self.max_sessions {
                return Err(ServerError::Session("max sessions reached".to_string()));
            }
        }

        let id = Uuid::new_v4().to_string();
        let session = DialogueSession::spawn(&id, settings, adapters);
        sessions.insert(id, session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<DialogueSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        if let Some(session) = self.sessions.write().remove(id) {
            session.close();
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn cleanup_expired(&self) {
        let mut sessions = self.sessions.write();
        self.cleanup_expired_internal(&mut sessions);
    }

    fn cleanup_expired_internal(&self, sessions: &mut HashMap<String, Arc<DialogueSession>>) {
        let timeout = self.session_timeout;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.is_expired(timeout))
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(session) = sessions.remove(&id) {
                session.close();
                tracing::info!(session_id = %id, "expired session removed");
            }
        }
    }

    /// Periodic cleanup task; returns its shutdown token.
    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration) -> CancelToken {
        let shutdown = CancelToken::new();
        let manager = Arc::clone(self);
        let token = shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let before = manager.count();
                        manager.cleanup_expired();
                        let after = manager.count();
                        if before != after {
                            tracing::info!(removed = before - after, remaining = after, "session cleanup");
                        }
                    }
                }
            }
        });

        shutdown
    }
}
