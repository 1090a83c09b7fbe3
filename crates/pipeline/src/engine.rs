//! Dialogue engine.
//!
//! One task drives the classifier, the turn machine, the pre-roll ring,
//! the recognition manager, and the sentence queue: every inbound frame or
//! control event is handled to completion before the next one, so machine
//! state never races. Control events outrank frames within a tick, which
//! realizes the documented tie-breaks.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use lumina_config::Settings;
use lumina_core::{
    AudioFrame, BusEvent, CancelToken, ControlEvent, EventBus, RecognizerBackend, RecognizerEvent,
    Transcript, TurnPhase,
};

use crate::classifier::FrameClassifier;
use crate::orchestrator::ReplySlot;
use crate::preroll::PreRollRing;
use crate::recognizer::RecognitionManager;
use crate::sentences::SentenceAggregator;
use crate::turn::{TurnAction, TurnMachine};

/// Inputs multiplexed into the engine task.
pub enum EngineCommand {
    /// One captured audio frame.
    Frame(AudioFrame),
    /// Client-reported contiguous silence (out-of-band observation).
    ClientSilence(u32),
    /// Drain the recognizer and answer with the last final, if any.
    Stop {
        respond_to: oneshot::Sender<Option<Transcript>>,
    },
}

/// Couples the frame path to the turn machine and the recognizer.
pub struct DialogueEngine {
    classifier: FrameClassifier,
    machine: TurnMachine,
    preroll: PreRollRing,
    recognizer: RecognitionManager,
    sentences: Arc<SentenceAggregator>,
    bus: EventBus,
    phase_tx: watch::Sender<TurnPhase>,
    slot: ReplySlot,
}

impl DialogueEngine {
    pub fn new(
        settings: &Settings,
        backend: Arc<dyn RecognizerBackend>,
        sentences: Arc<SentenceAggregator>,
        bus: EventBus,
        slot: ReplySlot,
    ) -> (Self, watch::Receiver<TurnPhase>) {
        let (phase_tx, phase_rx) = watch::channel(TurnPhase::Initial);
        let engine = Self {
            classifier: FrameClassifier::new(settings.classifier.clone()),
            machine: TurnMachine::new(settings.turn.clone()),
            preroll: PreRollRing::new(settings.turn.pre_roll_frames),
            recognizer: RecognitionManager::new(backend, settings.recognizer.clone()),
            sentences,
            bus,
            phase_tx,
            slot,
        };
        (engine, phase_rx)
    }

    /// The phase observers currently see.
    pub fn visible_phase(&self) -> TurnPhase {
        self.machine.visible_phase()
    }

    /// Drive the engine until both inputs close or shutdown fires.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut controls: mpsc::Receiver<ControlEvent>,
        shutdown: CancelToken,
    ) {
        let mut controls_open = true;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = controls.recv(), if controls_open => {
                    match event {
                        Some(event) => self.handle_control(event).await,
                        None => controls_open = false,
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(EngineCommand::Frame(frame)) => self.handle_frame(frame).await,
                        Some(EngineCommand::ClientSilence(ms)) => self.observe_client_silence(ms),
                        Some(EngineCommand::Stop { respond_to }) => {
                            let final_transcript = self.drain_session().await;
                            let _ = respond_to.send(final_transcript);
                        }
                        None => break,
                    }
                }
            }
        }

        if self.recognizer.is_active() {
            self.recognizer.abort().await;
        }
        tracing::debug!("dialogue engine stopped");
    }

    /// Process one captured frame to completion.
    pub async fn handle_frame(&mut self, frame: AudioFrame) {
        let cls = self.classifier.classify(&frame);
        self.bus.publish(BusEvent::FrameClassified(cls));

        if cls.is_voice {
            self.preroll.push(frame.clone());
        }

        let actions = self.machine.on_frame(cls);
        let reset_needed = self.apply_actions(actions, Some(&frame)).await;
        let reset_needed = reset_needed | self.pump_recognizer().await;

        if reset_needed {
            self.reset_after_failure().await;
        }
    }

    /// Process one control event to completion.
    pub async fn handle_control(&mut self, event: ControlEvent) {
        self.bus.publish(BusEvent::Control(event));

        let actions = self.machine.on_control(event);
        let tears_down = actions.contains(&TurnAction::TearDownSession);
        let reset_needed = self.apply_actions(actions, None).await;

        if tears_down {
            // Events queued by the closed session must not leak out.
            let discarded = self.recognizer.poll_events();
            if !discarded.is_empty() {
                tracing::debug!(count = discarded.len(), "discarded events from closed session");
            }
            self.classifier.reset();
            self.preroll.clear();
        }

        if reset_needed {
            self.reset_after_failure().await;
        }
    }

    /// Seed the silence counter from a client-side observation.
    pub fn observe_client_silence(&mut self, silence_ms: u32) {
        self.classifier.observe_client_silence(silence_ms);
    }

    /// Drain the recognizer for a stop request; the last final (if any) is
    /// queued like any other sentence and returned to the caller.
    pub async fn drain_session(&mut self) -> Option<Transcript> {
        if !self.recognizer.is_active() {
            return None;
        }

        let _ = self.pump_recognizer().await;
        let drained = match self.recognizer.end_session().await {
            Ok(drained) => drained,
            Err(e) => {
                tracing::warn!(error = %e, "drain failed");
                None
            }
        };
        let _ = self.pump_recognizer().await;

        if let Some(transcript) = &drained {
            self.sentences.push_sentence(&transcript.text);
            self.bus.publish(BusEvent::SentenceFinalized {
                text: transcript.text.clone(),
                sequence: transcript.sequence,
            });
        }

        let actions = self.machine.on_session_drained();
        let _ = self.apply_actions(actions, None).await;
        self.classifier.reset();
        self.preroll.clear();

        drained
    }

    /// Apply machine actions in order. Returns whether a terminal
    /// recognizer failure requires the reset path.
    async fn apply_actions(&mut self, actions: Vec<TurnAction>, frame: Option<&AudioFrame>) -> bool {
        let mut reset_needed = false;

        for action in actions {
            match action {
                TurnAction::StartSessionWithPreRoll => {
                    match self.recognizer.start_session().await {
                        Ok(_) => {
                            let snapshot = self.preroll.snapshot();
                            self.recognizer.send_frames(&snapshot).await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "could not start recognition session");
                            self.bus.publish(BusEvent::RecognizerError {
                                message: e.to_string(),
                                terminal: true,
                            });
                            reset_needed = true;
                        }
                    }
                }
                TurnAction::PrependPreRoll => {
                    let snapshot = self.preroll.snapshot();
                    self.recognizer.send_frames(&snapshot).await;
                }
                TurnAction::ForwardFrame => {
                    if let Some(frame) = frame {
                        self.recognizer.send_frame(frame).await;
                    }
                }
                TurnAction::TearDownSession => {
                    self.recognizer.abort().await;
                }
                TurnAction::PhaseChanged { from, to } => {
                    tracing::info!(%from, %to, "phase changed");
                    let _ = self.phase_tx.send(to);
                    self.bus.publish(BusEvent::PhaseChanged { from, to });
                }
                TurnAction::RequestInterrupt => {
                    self.bus.publish(BusEvent::InterruptRequested);
                }
                TurnAction::CancelReply => {
                    if let Some(task_id) = self.slot.cancel_active() {
                        tracing::info!(task_id = %task_id, "cancelled reply");
                    }
                }
                TurnAction::ClearSentences => {
                    self.sentences.clear();
                }
            }
        }

        reset_needed
    }

    /// Deliver recognizer events to the queue, the bus, and the machine.
    /// Returns whether a terminal failure requires the reset path.
    async fn pump_recognizer(&mut self) -> bool {
        let mut reset_needed = false;

        for event in self.recognizer.poll_events() {
            match &event {
                RecognizerEvent::PartialEmitted(transcript) => {
                    self.sentences.note_partial(transcript);
                    self.bus
                        .publish(BusEvent::PartialTranscript(transcript.clone()));
                }
                RecognizerEvent::SentenceFinalized { text, sequence } => {
                    self.sentences.push_sentence(text);
                    self.bus.publish(BusEvent::SentenceFinalized {
                        text: text.clone(),
                        sequence: *sequence,
                    });
                }
                RecognizerEvent::SessionStarted { session_id } => {
                    self.bus.publish(BusEvent::RecognizerSessionStarted {
                        session_id: session_id.clone(),
                    });
                }
                RecognizerEvent::Error { message, terminal } => {
                    self.bus.publish(BusEvent::RecognizerError {
                        message: message.clone(),
                        terminal: *terminal,
                    });
                    if *terminal {
                        reset_needed = true;
                    }
                }
                RecognizerEvent::Closed => {}
            }

            let actions = self.machine.on_recognizer(&event);
            reset_needed |= self.apply_actions(actions, None).await;
        }

        reset_needed
    }

    /// The recognizer died past its retry budget: end the current session
    /// the same way an operator reset would.
    async fn reset_after_failure(&mut self) {
        tracing::warn!("recognizer failed terminally, resetting to Initial");
        self.bus
            .publish(BusEvent::Control(ControlEvent::ResetToInitial));

        let actions = self.machine.on_control(ControlEvent::ResetToInitial);
        let _ = self.apply_actions(actions, None).await;
        let _ = self.recognizer.poll_events();
        self.classifier.reset();
        self.preroll.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::ScriptedRecognizer;
    use lumina_core::Classification;

    fn settings() -> Settings {
        Settings::default()
    }

    fn voice_frame(seq: u64) -> AudioFrame {
        // First sample encodes the sequence so upstream order is checkable.
        let mut samples = vec![2000i16; 320];
        samples[0] = seq as i16;
        AudioFrame::new(samples, seq, Classification::Voice)
    }

    fn silence_frame(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0; 320], seq, Classification::Silence)
    }

    struct Rig {
        engine: DialogueEngine,
        backend: Arc<ScriptedRecognizer>,
        sentences: Arc<SentenceAggregator>,
        bus: EventBus,
    }

    fn rig() -> Rig {
        let backend = Arc::new(ScriptedRecognizer::new());
        let sentences = Arc::new(SentenceAggregator::new(200));
        let bus = EventBus::new(256);
        let (engine, _phase_rx) = DialogueEngine::new(
            &settings(),
            backend.clone() as Arc<dyn RecognizerBackend>,
            sentences.clone(),
            bus.clone(),
            ReplySlot::new(),
        );
        Rig {
            engine,
            backend,
            sentences,
            bus,
        }
    }

    #[tokio::test]
    async fn test_first_voice_frame_starts_session_with_preroll() {
        let mut r = rig();

        // Pre-roll only retains voice; these two frames precede the session.
        r.engine.handle_frame(silence_frame(0)).await;
        r.engine.handle_frame(voice_frame(1)).await;

        assert_eq!(r.backend.sessions_started(), 1);
        // The triggering frame is the tail of the injected pre-roll.
        assert_eq!(r.backend.received_first_samples(), vec![1]);
    }

    #[tokio::test]
    async fn test_preroll_precedes_live_frames_in_capture_order() {
        let mut r = rig();

        // First session: entry frame as pre-roll, then live frames.
        for seq in 0..3 {
            r.engine.handle_frame(voice_frame(seq)).await;
        }
        // Tear down and go to Listening.
        r.engine
            .handle_control(ControlEvent::PlaybackStarted)
            .await;
        // Ring was cleared on teardown; build fresh voice during playback.
        r.engine.handle_frame(voice_frame(10)).await;
        r.engine.handle_frame(voice_frame(11)).await;

        assert_eq!(r.backend.sessions_started(), 2);
        let received = r.backend.received_first_samples();
        // Session 1 saw frames 0..3 (pre-roll of one, then live frames).
        // Session 2 saw pre-roll [10] then live 11.
        assert_eq!(received, vec![0, 1, 2, 10, 11]);
    }

    #[tokio::test]
    async fn test_nonempty_partial_confirms_speaking() {
        let mut r = rig();
        r.backend.partial_at(2, "hello");

        let mut sub = r.bus.subscribe();
        for seq in 0..3 {
            r.engine.handle_frame(voice_frame(seq)).await;
        }

        assert_eq!(r.engine.visible_phase(), TurnPhase::Speaking);
        let events = sub.drain();
        assert!(events.iter().any(|e| matches!(
            e,
            BusEvent::PhaseChanged {
                from: TurnPhase::Initial,
                to: TurnPhase::Speaking
            }
        )));
    }

    #[tokio::test]
    async fn test_finalized_sentences_reach_queue() {
        let mut r = rig();
        r.backend.partial_at(1, "hello");
        r.backend.sentence_at(3, "hello there.");

        for seq in 0..4 {
            r.engine.handle_frame(voice_frame(seq)).await;
        }

        assert_eq!(r.sentences.consume_all(), vec!["hello there.".to_string()]);
    }

    #[tokio::test]
    async fn test_reset_discards_closed_session_output() {
        let mut r = rig();
        r.backend.partial_at(1, "hello wo");

        for seq in 0..3 {
            r.engine.handle_frame(voice_frame(seq)).await;
        }
        // Sentence committed upstream but not yet pumped when reset lands.
        r.backend.sentence_at(3, "hello world.");
        r.engine
            .handle_control(ControlEvent::ResetToInitial)
            .await;

        assert_eq!(r.engine.visible_phase(), TurnPhase::Initial);
        assert!(r.sentences.consume_all().is_empty());

        // Frames after the reset do not resurrect the old session.
        r.engine.handle_frame(silence_frame(10)).await;
        assert!(r.sentences.consume_all().is_empty());
    }

    #[tokio::test]
    async fn test_stop_drains_final_into_queue() {
        let mut r = rig();
        r.backend.partial_at(1, "hel");
        r.backend.final_on_end("hello world");

        for seq in 0..3 {
            r.engine.handle_frame(voice_frame(seq)).await;
        }

        let drained = r.engine.drain_session().await;
        assert_eq!(drained.unwrap().text, "hello world");
        assert_eq!(r.engine.visible_phase(), TurnPhase::Initial);
        assert_eq!(r.sentences.consume_all(), vec!["hello world".to_string()]);
    }

    #[tokio::test]
    async fn test_session_start_failure_resets() {
        let backend = Arc::new(ScriptedRecognizer::new());
        backend.refuse_restarts();
        // Exhaust the one allowed start.
        backend.start_session().await.unwrap();

        let sentences = Arc::new(SentenceAggregator::new(200));
        let bus = EventBus::new(256);
        let mut sub = bus.subscribe();
        let (mut engine, _phase_rx) = DialogueEngine::new(
            &settings(),
            backend as Arc<dyn RecognizerBackend>,
            sentences,
            bus,
            ReplySlot::new(),
        );

        engine.handle_frame(voice_frame(0)).await;

        assert_eq!(engine.visible_phase(), TurnPhase::Initial);
        let events = sub.drain();
        assert!(events
            .iter()
            .any(|e| matches!(e, BusEvent::RecognizerError { terminal: true, .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            BusEvent::Control(ControlEvent::ResetToInitial)
        )));
    }
}
