//! Dialogue orchestrator.
//!
//! Polls the sentence queue, and for each completed user turn drives one
//! reply: language model -> synthesizer -> playback. At most one reply task
//! is active at a time; a newer turn supersedes the older reply by firing
//! its cancel token and waiting for it to wind down before the successor
//! emits audio.
//!
//! The cancel token is checked immediately before every playback write.
//! That is the transport boundary: once a token fires, no further chunk of
//! that reply reaches the egress, even if the vendor already produced it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use lumina_config::ReplyConfig;
use lumina_core::{
    BusEvent, CancelToken, Error, EventBus, LanguageModel, PlaybackSink, SpeechSynthesizer,
    TurnPhase,
};

use crate::sentences::SentenceAggregator;

struct ActiveReply {
    task_id: String,
    cancel: CancelToken,
    started_at: std::time::Instant,
    handle: JoinHandle<()>,
}

/// Shared handle to the at-most-one active reply.
///
/// The barge-in coordinator fires the cancel through this; the reply task
/// clears its own entry when it finishes.
#[derive(Clone, Default)]
pub struct ReplySlot(Arc<Mutex<Option<ActiveReply>>>);

impl ReplySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the active reply's cancel token, if any. Returns its task id.
    pub fn cancel_active(&self) -> Option<String> {
        let guard = self.0.lock();
        guard.as_ref().map(|reply| {
            reply.cancel.cancel();
            reply.task_id.clone()
        })
    }

    pub fn has_active(&self) -> bool {
        self.0.lock().is_some()
    }

    fn install(&self, reply: ActiveReply) {
        *self.0.lock() = Some(reply);
    }

    fn take(&self) -> Option<ActiveReply> {
        self.0.lock().take()
    }

    fn clear_if(&self, task_id: &str) {
        let mut guard = self.0.lock();
        if guard.as_ref().is_some_and(|r| r.task_id == task_id) {
            *guard = None;
        }
    }
}

/// Why a reply stopped early.
enum ReplyError {
    Cancelled,
    Llm(Error),
    Synthesis { error: Error, produced_output: bool },
}

/// Everything one reply task needs, cloneable across the spawn boundary.
#[derive(Clone)]
struct ReplyContext {
    config: ReplyConfig,
    system_prompt: String,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn SpeechSynthesizer>,
    playback: Arc<dyn PlaybackSink>,
    bus: EventBus,
    slot: ReplySlot,
    task_id: String,
    cancel: CancelToken,
}

/// Converts completed user turns into streamed replies.
pub struct DialogueOrchestrator {
    config: ReplyConfig,
    system_prompt: String,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn SpeechSynthesizer>,
    playback: Arc<dyn PlaybackSink>,
    sentences: Arc<SentenceAggregator>,
    bus: EventBus,
    phase_rx: watch::Receiver<TurnPhase>,
    slot: ReplySlot,
}

impl DialogueOrchestrator {
    /// `slot` is shared with the engine (reset path) and the barge-in
    /// coordinator; all three cancel through the same handle.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReplyConfig,
        system_prompt: String,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn SpeechSynthesizer>,
        playback: Arc<dyn PlaybackSink>,
        sentences: Arc<SentenceAggregator>,
        bus: EventBus,
        phase_rx: watch::Receiver<TurnPhase>,
        slot: ReplySlot,
    ) -> Self {
        Self {
            config,
            system_prompt,
            llm,
            tts,
            playback,
            sentences,
            bus,
            phase_rx,
            slot,
        }
    }

    /// Handle shared with the barge-in coordinator and the engine.
    pub fn reply_slot(&self) -> ReplySlot {
        self.slot.clone()
    }

    /// Driver loop: poll the sentence queue and start replies.
    ///
    /// Consumption is gated on the visible phase: while the user is still
    /// Speaking, finalized sentences stay queued so the turn completes as
    /// one utterance.
    pub async fn run(self, shutdown: CancelToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.monitor_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let phase = *self.phase_rx.borrow();
            if !matches!(phase, TurnPhase::Initial | TurnPhase::Waiting) {
                continue;
            }

            let batch = self.sentences.consume_all();
            if batch.is_empty() {
                continue;
            }

            let utterance = batch.join(" ");
            self.start_reply(utterance).await;
        }

        // Wind down any in-flight reply on shutdown.
        if let Some(previous) = self.slot.take() {
            previous.cancel.cancel();
            let _ = previous.handle.await;
        }
        tracing::debug!("orchestrator stopped");
    }

    async fn start_reply(&self, utterance: String) {
        // Supersede: the predecessor is cancelled and fully wound down
        // before the successor can emit its first chunk.
        if let Some(previous) = self.slot.take() {
            tracing::info!(
                task_id = %previous.task_id,
                ran_ms = previous.started_at.elapsed().as_millis() as u64,
                "superseding active reply"
            );
            previous.cancel.cancel();
            let _ = previous.handle.await;
        }

        let task_id = Uuid::new_v4().to_string();
        let cancel = CancelToken::new();

        tracing::info!(task_id = %task_id, utterance = %utterance, "starting reply");
        self.bus.publish(BusEvent::ReplyStarted {
            task_id: task_id.clone(),
            utterance: utterance.clone(),
        });

        let ctx = ReplyContext {
            config: self.config.clone(),
            system_prompt: self.system_prompt.clone(),
            llm: self.llm.clone(),
            tts: self.tts.clone(),
            playback: self.playback.clone(),
            bus: self.bus.clone(),
            slot: self.slot.clone(),
            task_id: task_id.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(run_reply(ctx, utterance));

        self.slot.install(ActiveReply {
            task_id,
            cancel,
            started_at: std::time::Instant::now(),
            handle,
        });
    }
}

async fn run_reply(ctx: ReplyContext, utterance: String) {
    let outcome = stream_reply(&ctx, &utterance).await;

    let cancelled = match outcome {
        Ok(()) => {
            let _ = ctx.playback.end_of_reply().await;
            false
        }
        Err(ReplyError::Cancelled) => {
            // The barge-in path already dropped buffered audio; emitting an
            // end marker here would race the successor's stream.
            true
        }
        Err(ReplyError::Llm(error)) => {
            tracing::warn!(task_id = %ctx.task_id, error = %error, "language model failed, speaking fallback");
            if !ctx.cancel.is_cancelled() {
                let mut produced = false;
                let fallback = ctx.config.fallback_reply.clone();
                if let Err(ReplyError::Synthesis { error, .. }) =
                    speak_text(&ctx, &fallback, &mut produced).await
                {
                    tracing::warn!(error = %error, "fallback synthesis failed");
                }
                let _ = ctx.playback.end_of_reply().await;
            }
            ctx.cancel.is_cancelled()
        }
        Err(ReplyError::Synthesis {
            error,
            produced_output,
        }) => {
            if produced_output {
                // Mid-reply failure: truncate gracefully so the client sees
                // playback end normally.
                tracing::warn!(task_id = %ctx.task_id, error = %error, "synthesis failed mid-reply, truncating");
                let _ = ctx.playback.end_of_reply().await;
            } else {
                tracing::warn!(task_id = %ctx.task_id, error = %error, "synthesis failed before any audio, dropping reply");
            }
            false
        }
    };

    ctx.slot.clear_if(&ctx.task_id);
    tracing::info!(task_id = %ctx.task_id, cancelled, "reply finished");
    ctx.bus.publish(BusEvent::ReplyFinished {
        task_id: ctx.task_id.clone(),
        cancelled,
    });
}

/// Stream the model's reply through synthesis into playback.
async fn stream_reply(ctx: &ReplyContext, utterance: &str) -> Result<(), ReplyError> {
    let prompt = format!("{}\n\nUser: {}", ctx.system_prompt, utterance);

    let (text_tx, mut text_rx) = mpsc::channel(32);
    let llm = ctx.llm.clone();
    let llm_cancel = ctx.cancel.clone();
    let llm_timeout = Duration::from_millis(ctx.config.llm_timeout_ms);
    let llm_task = tokio::spawn(async move {
        match tokio::time::timeout(llm_timeout, llm.generate(&prompt, llm_cancel, text_tx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("language model call")),
        }
    });

    let mut produced_output = false;
    while let Some(chunk) = text_rx.recv().await {
        if ctx.cancel.is_cancelled() {
            llm_task.abort();
            return Err(ReplyError::Cancelled);
        }
        if let Err(e) = speak_text(ctx, &chunk, &mut produced_output).await {
            llm_task.abort();
            return Err(e);
        }
    }

    match llm_task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(Error::Cancelled)) => Err(ReplyError::Cancelled),
        Ok(Err(error)) => Err(ReplyError::Llm(error)),
        Err(join_error) => Err(ReplyError::Llm(Error::Internal(format!(
            "language model task failed: {join_error}"
        )))),
    }
}

/// Synthesize one piece of text and forward its audio chunks.
async fn speak_text(
    ctx: &ReplyContext,
    text: &str,
    produced_output: &mut bool,
) -> Result<(), ReplyError> {
    let (audio_tx, mut audio_rx) = mpsc::channel(32);
    let tts = ctx.tts.clone();
    let tts_cancel = ctx.cancel.clone();
    let tts_timeout = Duration::from_millis(ctx.config.tts_timeout_ms);
    let text_owned = text.to_string();
    let synth_task = tokio::spawn(async move {
        match tokio::time::timeout(tts_timeout, tts.synthesize(&text_owned, tts_cancel, audio_tx))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("synthesis request")),
        }
    });

    let chunk_timeout = Duration::from_millis(ctx.config.tts_chunk_timeout_ms);
    loop {
        match tokio::time::timeout(chunk_timeout, audio_rx.recv()).await {
            Err(_) => {
                synth_task.abort();
                return Err(ReplyError::Synthesis {
                    error: Error::Timeout("synthesized chunk read"),
                    produced_output: *produced_output,
                });
            }
            Ok(None) => break,
            Ok(Some(chunk)) => {
                // Transport boundary: the last place a chunk of a cancelled
                // reply can be dropped.
                if ctx.cancel.is_cancelled() {
                    synth_task.abort();
                    return Err(ReplyError::Cancelled);
                }
                if let Err(error) = ctx.playback.send_chunk(&chunk).await {
                    synth_task.abort();
                    return Err(ReplyError::Synthesis {
                        error,
                        produced_output: *produced_output,
                    });
                }
                *produced_output = true;
            }
        }
    }

    match synth_task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(Error::Cancelled)) => Err(ReplyError::Cancelled),
        Ok(Err(error)) => Err(ReplyError::Synthesis {
            error,
            produced_output: *produced_output,
        }),
        Err(join_error) => Err(ReplyError::Synthesis {
            error: Error::Internal(format!("synthesis task failed: {join_error}")),
            produced_output: *produced_output,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::{
        RecordingPlayback, ScriptedLanguageModel, ScriptedSynthesizer, SynthFailure,
    };

    struct Harness {
        orchestrator: DialogueOrchestrator,
        sentences: Arc<SentenceAggregator>,
        playback: Arc<RecordingPlayback>,
        phase_tx: watch::Sender<TurnPhase>,
        bus: EventBus,
    }

    fn harness(
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn SpeechSynthesizer>,
        playback: Arc<RecordingPlayback>,
    ) -> Harness {
        let sentences = Arc::new(SentenceAggregator::new(200));
        let bus = EventBus::new(64);
        let (phase_tx, phase_rx) = watch::channel(TurnPhase::Initial);
        let orchestrator = DialogueOrchestrator::new(
            ReplyConfig::default(),
            "You are a voice assistant.".to_string(),
            llm,
            tts,
            playback.clone() as Arc<dyn PlaybackSink>,
            sentences.clone(),
            bus.clone(),
            phase_rx,
            ReplySlot::new(),
        );
        Harness {
            orchestrator,
            sentences,
            playback,
            phase_tx,
            bus,
        }
    }

    async fn wait_for_finish(sub: &mut lumina_core::BusSubscriber) -> bool {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await {
                Ok(Some(BusEvent::ReplyFinished { cancelled, .. })) => return cancelled,
                Ok(Some(_)) => continue,
                _ => panic!("no ReplyFinished event"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_streams_llm_through_tts_to_playback() {
        let llm = Arc::new(ScriptedLanguageModel::with_reply(&["Hello ", "there."]));
        let tts = Arc::new(ScriptedSynthesizer::new(2));
        let playback = Arc::new(RecordingPlayback::new());
        let h = harness(llm, tts.clone(), playback.clone());

        let mut sub = h.bus.subscribe();
        let shutdown = CancelToken::new();
        let run = tokio::spawn(h.orchestrator.run(shutdown.clone()));

        h.sentences.push_sentence("hi there");
        let cancelled = wait_for_finish(&mut sub).await;

        assert!(!cancelled);
        // Two text chunks, two audio chunks each.
        assert_eq!(playback.played_chunks(), 4);
        assert_eq!(playback.ends(), 1);
        assert_eq!(tts.texts(), vec!["Hello ".to_string(), "there.".to_string()]);

        shutdown.cancel();
        let _ = run.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumption_gated_while_speaking() {
        let llm = Arc::new(ScriptedLanguageModel::with_reply(&["ok."]));
        let tts = Arc::new(ScriptedSynthesizer::new(1));
        let playback = Arc::new(RecordingPlayback::new());
        let h = harness(llm, tts, playback.clone());

        let mut sub = h.bus.subscribe();
        let shutdown = CancelToken::new();
        h.phase_tx.send(TurnPhase::Speaking).unwrap();
        let run = tokio::spawn(h.orchestrator.run(shutdown.clone()));

        h.sentences.push_sentence("first half");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.sentences.len(), 1, "queue untouched while Speaking");
        assert_eq!(playback.played_chunks(), 0);

        h.phase_tx.send(TurnPhase::Waiting).unwrap();
        let cancelled = wait_for_finish(&mut sub).await;
        assert!(!cancelled);
        assert_eq!(playback.ends(), 1);

        shutdown.cancel();
        let _ = run.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_utterance_supersedes_active_reply() {
        let llm = Arc::new(ScriptedLanguageModel::with_reply(&["a ", "b ", "c ", "d."]));
        // Slow synthesis keeps the first reply in flight.
        let tts =
            Arc::new(ScriptedSynthesizer::new(3).with_chunk_delay(Duration::from_millis(50)));
        let playback = Arc::new(RecordingPlayback::new());
        let h = harness(llm, tts, playback.clone());

        let mut sub = h.bus.subscribe();
        let shutdown = CancelToken::new();
        let run = tokio::spawn(h.orchestrator.run(shutdown.clone()));

        h.sentences.push_sentence("first question");
        // Let the first reply get going, then complete a second turn.
        tokio::time::sleep(Duration::from_millis(220)).await;
        h.sentences.push_sentence("never mind, second question");

        // First finish must be the cancelled predecessor.
        let first_cancelled = wait_for_finish(&mut sub).await;
        assert!(first_cancelled);
        let second_cancelled = wait_for_finish(&mut sub).await;
        assert!(!second_cancelled);

        shutdown.cancel();
        let _ = run.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_failure_speaks_fallback() {
        let llm = Arc::new(ScriptedLanguageModel::failing());
        let tts = Arc::new(ScriptedSynthesizer::new(1));
        let playback = Arc::new(RecordingPlayback::new());
        let h = harness(llm, tts.clone(), playback.clone());

        let mut sub = h.bus.subscribe();
        let shutdown = CancelToken::new();
        let run = tokio::spawn(h.orchestrator.run(shutdown.clone()));

        h.sentences.push_sentence("hello?");
        let cancelled = wait_for_finish(&mut sub).await;

        assert!(!cancelled);
        let texts = tts.texts();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0], ReplyConfig::default().fallback_reply);
        assert_eq!(playback.played_chunks(), 1);
        assert_eq!(playback.ends(), 1);

        shutdown.cancel();
        let _ = run.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tts_failure_before_audio_drops_reply() {
        let llm = Arc::new(ScriptedLanguageModel::with_reply(&["hi."]));
        let tts = Arc::new(ScriptedSynthesizer::new(2).with_failure(SynthFailure::OnFirstChunk));
        let playback = Arc::new(RecordingPlayback::new());
        let h = harness(llm, tts, playback.clone());

        let mut sub = h.bus.subscribe();
        let shutdown = CancelToken::new();
        let run = tokio::spawn(h.orchestrator.run(shutdown.clone()));

        h.sentences.push_sentence("hello?");
        let cancelled = wait_for_finish(&mut sub).await;

        assert!(!cancelled);
        assert_eq!(playback.played_chunks(), 0, "nothing reaches the egress");
        assert_eq!(playback.ends(), 0, "no end marker for a dropped reply");

        shutdown.cancel();
        let _ = run.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tts_failure_mid_reply_truncates() {
        let llm = Arc::new(ScriptedLanguageModel::with_reply(&["hi."]));
        let tts = Arc::new(ScriptedSynthesizer::new(3).with_failure(SynthFailure::AfterFirstChunk));
        let playback = Arc::new(RecordingPlayback::new());
        let h = harness(llm, tts, playback.clone());

        let mut sub = h.bus.subscribe();
        let shutdown = CancelToken::new();
        let run = tokio::spawn(h.orchestrator.run(shutdown.clone()));

        h.sentences.push_sentence("hello?");
        let cancelled = wait_for_finish(&mut sub).await;

        assert!(!cancelled);
        assert_eq!(playback.played_chunks(), 1);
        // Truncated replies still close playback normally.
        assert_eq!(playback.ends(), 1);

        shutdown.cancel();
        let _ = run.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_blocks_chunks_at_transport_boundary() {
        let llm = Arc::new(ScriptedLanguageModel::with_reply(&["long reply"]));
        let tts =
            Arc::new(ScriptedSynthesizer::new(50).with_chunk_delay(Duration::from_millis(10)));
        let playback = Arc::new(RecordingPlayback::new().pause_after(5));
        let h = harness(llm, tts, playback.clone());

        let mut sub = h.bus.subscribe();
        let shutdown = CancelToken::new();
        let slot = h.orchestrator.reply_slot();
        let run = tokio::spawn(h.orchestrator.run(shutdown.clone()));

        h.sentences.push_sentence("tell me everything");
        playback.wait_until_blocked().await;

        // Barge-in: fire the token, then drop the buffered chunk.
        assert!(slot.cancel_active().is_some());
        playback.drop_buffered().await.unwrap();

        let cancelled = wait_for_finish(&mut sub).await;
        assert!(cancelled);
        assert_eq!(playback.played_chunks(), 5, "no chunk after the cancel point");
        assert_eq!(playback.ends(), 0);

        shutdown.cancel();
        let _ = run.await;
    }
}
