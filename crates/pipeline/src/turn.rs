//! Turn state machine.
//!
//! Sole authority on the conversational phase. Handlers are synchronous and
//! run to completion per event; side effects are returned as actions for the
//! engine to apply, so every transition is deterministic and testable
//! without a runtime.
//!
//! The `TransitionBuffer` phase is probationary and hidden: observers keep
//! seeing the phase the machine occupied when the buffer was entered, and
//! phase-change actions only ever name externally visible phases.

use lumina_config::TurnConfig;
use lumina_core::{ControlEvent, FrameClassification, RecognizerEvent, TurnPhase, FRAME_MS};

/// Side effects requested by a transition, applied by the engine in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnAction {
    /// Open a recognition session and inject the pre-roll snapshot
    /// (which ends with the frame that triggered this).
    StartSessionWithPreRoll,
    /// Inject the pre-roll snapshot into the already-open session.
    PrependPreRoll,
    /// Forward the current frame to the recognizer.
    ForwardFrame,
    /// Abort the recognition session without draining.
    TearDownSession,
    /// Announce an externally visible phase change.
    PhaseChanged { from: TurnPhase, to: TurnPhase },
    /// The user took the floor over agent playback.
    RequestInterrupt,
    /// Cancel the in-flight reply, if any.
    CancelReply,
    /// Discard queued sentences that will never be consumed.
    ClearSentences,
}

/// The five-phase turn-taking machine.
pub struct TurnMachine {
    config: TurnConfig,
    phase: TurnPhase,
    /// What observers currently see; never `TransitionBuffer`.
    visible: TurnPhase,
    /// Frames elapsed since the buffer was entered (entry frame excluded).
    buffer_frames: u32,
    /// Voice frames seen since the buffer was entered (entry frame included).
    buffer_voice_frames: u32,
    /// Whether a non-empty partial arrived since the buffer was entered.
    buffer_has_content: bool,
}

impl TurnMachine {
    pub fn new(config: TurnConfig) -> Self {
        Self {
            config,
            phase: TurnPhase::Initial,
            visible: TurnPhase::Initial,
            buffer_frames: 0,
            buffer_voice_frames: 0,
            buffer_has_content: false,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// The phase observers see. Invariant: never `TransitionBuffer`.
    pub fn visible_phase(&self) -> TurnPhase {
        self.visible
    }

    /// Whether a recognition session should currently exist.
    pub fn has_session(&self) -> bool {
        matches!(
            self.phase,
            TurnPhase::TransitionBuffer | TurnPhase::Speaking | TurnPhase::Waiting
        )
    }

    fn enter_buffer(&mut self) {
        self.phase = TurnPhase::TransitionBuffer;
        self.buffer_frames = 0;
        self.buffer_voice_frames = 1;
        self.buffer_has_content = false;
    }

    fn set_visible(&mut self, to: TurnPhase, actions: &mut Vec<TurnAction>) {
        debug_assert!(to.is_externally_visible());
        if self.visible != to {
            actions.push(TurnAction::PhaseChanged {
                from: self.visible,
                to,
            });
            self.visible = to;
        }
    }

    /// The buffer confirms speech once the recognizer produced content and
    /// enough voice frames arrived.
    fn try_confirm_speech(&mut self, actions: &mut Vec<TurnAction>) {
        if self.phase != TurnPhase::TransitionBuffer {
            return;
        }
        if self.buffer_has_content && self.buffer_voice_frames >= self.config.min_voice_frames_to_speak
        {
            self.phase = TurnPhase::Speaking;
            self.set_visible(TurnPhase::Speaking, actions);
            tracing::debug!(
                voice_frames = self.buffer_voice_frames,
                "speech confirmed, leaving transition buffer"
            );
        }
    }

    /// Handle one classified frame.
    pub fn on_frame(&mut self, cls: FrameClassification) -> Vec<TurnAction> {
        let mut actions = Vec::new();

        match (self.phase, cls.is_voice) {
            (TurnPhase::Initial, true) => {
                self.enter_buffer();
                actions.push(TurnAction::StartSessionWithPreRoll);
            }
            (TurnPhase::Initial, false) => {}

            (TurnPhase::TransitionBuffer, is_voice) => {
                self.buffer_frames += 1;
                if is_voice {
                    self.buffer_voice_frames += 1;
                }
                actions.push(TurnAction::ForwardFrame);

                self.try_confirm_speech(&mut actions);

                if self.phase == TurnPhase::TransitionBuffer
                    && !self.buffer_has_content
                    && self.buffer_frames * FRAME_MS >= self.config.transition_buffer_timeout_ms
                {
                    // Nothing recognizable arrived in time: the audio was spurious.
                    tracing::debug!(
                        elapsed_ms = self.buffer_frames * FRAME_MS,
                        "transition buffer timed out without a partial"
                    );
                    self.phase = TurnPhase::Initial;
                    actions.push(TurnAction::TearDownSession);
                    self.set_visible(TurnPhase::Initial, &mut actions);
                }
            }

            (TurnPhase::Speaking, true) => {
                actions.push(TurnAction::ForwardFrame);
            }
            (TurnPhase::Speaking, false) => {
                actions.push(TurnAction::ForwardFrame);
                if cls.contiguous_silence_ms >= self.config.max_silence_frames * FRAME_MS {
                    self.phase = TurnPhase::Waiting;
                    self.set_visible(TurnPhase::Waiting, &mut actions);
                }
            }

            (TurnPhase::Waiting, false) => {
                // Session stays open for late finals; silence keeps flowing
                // so the upstream can commit them.
                actions.push(TurnAction::ForwardFrame);
            }
            (TurnPhase::Waiting, true) => {
                // Possible continuation of the utterance.
                self.enter_buffer();
                actions.push(TurnAction::PrependPreRoll);
            }

            (TurnPhase::Listening, true) => {
                actions.push(TurnAction::RequestInterrupt);
                self.enter_buffer();
                actions.push(TurnAction::StartSessionWithPreRoll);
            }
            (TurnPhase::Listening, false) => {}
        }

        actions
    }

    /// Handle an out-of-band control event. Idempotent.
    pub fn on_control(&mut self, event: ControlEvent) -> Vec<TurnAction> {
        let mut actions = Vec::new();

        match event {
            ControlEvent::ResetToInitial => {
                actions.push(TurnAction::CancelReply);
                actions.push(TurnAction::ClearSentences);
                if self.has_session() {
                    actions.push(TurnAction::TearDownSession);
                }
                self.phase = TurnPhase::Initial;
                self.set_visible(TurnPhase::Initial, &mut actions);
            }

            ControlEvent::ForceEndSession => {
                actions.push(TurnAction::CancelReply);
                actions.push(TurnAction::ClearSentences);
                actions.push(TurnAction::TearDownSession);
                self.phase = TurnPhase::Initial;
                self.set_visible(TurnPhase::Initial, &mut actions);
            }

            ControlEvent::PlaybackStarted => {
                if self.phase != TurnPhase::Listening {
                    if self.has_session() {
                        actions.push(TurnAction::TearDownSession);
                    }
                    self.phase = TurnPhase::Listening;
                    self.set_visible(TurnPhase::Listening, &mut actions);
                }
            }

            ControlEvent::PlaybackEnded => match self.phase {
                TurnPhase::Listening => {
                    self.phase = TurnPhase::Initial;
                    self.set_visible(TurnPhase::Initial, &mut actions);
                }
                // A barge-in is already probing a new utterance; keep the
                // buffer but let observers see the floor open up.
                TurnPhase::TransitionBuffer if self.visible == TurnPhase::Listening => {
                    self.set_visible(TurnPhase::Initial, &mut actions);
                }
                _ => {}
            },

            ControlEvent::InterruptRequested => {
                actions.push(TurnAction::RequestInterrupt);
            }
        }

        actions
    }

    /// The session was drained on request (client stop): the utterance is
    /// over but queued sentences stay consumable.
    pub fn on_session_drained(&mut self) -> Vec<TurnAction> {
        let mut actions = Vec::new();
        if self.has_session() {
            self.phase = TurnPhase::Initial;
            self.set_visible(TurnPhase::Initial, &mut actions);
        }
        actions
    }

    /// Handle a recognizer event.
    ///
    /// Terminal recognizer failure is not a transition here: the engine
    /// reports it and injects `ResetToInitial` once the retry window is
    /// exhausted.
    pub fn on_recognizer(&mut self, event: &RecognizerEvent) -> Vec<TurnAction> {
        let mut actions = Vec::new();

        if let RecognizerEvent::PartialEmitted(transcript) = event {
            if !transcript.is_empty() && self.phase == TurnPhase::TransitionBuffer {
                self.buffer_has_content = true;
                self.try_confirm_speech(&mut actions);
            }
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumina_core::Transcript;

    fn machine() -> TurnMachine {
        TurnMachine::new(TurnConfig::default())
    }

    fn voice() -> FrameClassification {
        FrameClassification::voice()
    }

    fn silence(ms: u32) -> FrameClassification {
        FrameClassification::silence(ms)
    }

    fn nonempty_partial(seq: u64) -> RecognizerEvent {
        RecognizerEvent::PartialEmitted(Transcript::partial("hello", seq))
    }

    /// Feed silence frames with an accumulating counter.
    fn feed_silence(m: &mut TurnMachine, frames: u32, start_ms: u32) -> Vec<TurnAction> {
        let mut all = Vec::new();
        for i in 0..frames {
            all.extend(m.on_frame(silence(start_ms + (i + 1) * FRAME_MS)));
        }
        all
    }

    fn confirm_speaking(m: &mut TurnMachine) {
        let actions = m.on_frame(voice());
        assert!(actions.contains(&TurnAction::StartSessionWithPreRoll));
        m.on_frame(voice());
        m.on_frame(voice());
        m.on_recognizer(&nonempty_partial(1));
        assert_eq!(m.phase(), TurnPhase::Speaking);
    }

    #[test]
    fn test_initial_voice_enters_hidden_buffer() {
        let mut m = machine();
        let actions = m.on_frame(voice());

        assert_eq!(m.phase(), TurnPhase::TransitionBuffer);
        assert_eq!(m.visible_phase(), TurnPhase::Initial);
        assert_eq!(actions, vec![TurnAction::StartSessionWithPreRoll]);
    }

    #[test]
    fn test_initial_silence_is_inert() {
        let mut m = machine();
        assert!(m.on_frame(silence(FRAME_MS)).is_empty());
        assert_eq!(m.phase(), TurnPhase::Initial);
    }

    #[test]
    fn test_buffer_confirms_speech_with_partial_and_voice() {
        let mut m = machine();
        m.on_frame(voice());
        m.on_frame(voice());

        // Partial before the third voice frame: not yet enough voice.
        let actions = m.on_recognizer(&nonempty_partial(1));
        assert!(actions.is_empty());
        assert_eq!(m.phase(), TurnPhase::TransitionBuffer);

        let actions = m.on_frame(voice());
        assert_eq!(m.phase(), TurnPhase::Speaking);
        assert!(actions.contains(&TurnAction::PhaseChanged {
            from: TurnPhase::Initial,
            to: TurnPhase::Speaking,
        }));
    }

    #[test]
    fn test_empty_partial_does_not_confirm() {
        let mut m = machine();
        for _ in 0..4 {
            m.on_frame(voice());
        }
        m.on_recognizer(&RecognizerEvent::PartialEmitted(Transcript::partial("", 1)));
        assert_eq!(m.phase(), TurnPhase::TransitionBuffer);
    }

    #[test]
    fn test_buffer_times_out_without_partial() {
        let mut m = machine();
        m.on_frame(voice());
        m.on_frame(voice());
        m.on_frame(voice());

        // 500 ms of frames with no partial: spurious audio.
        let actions = feed_silence(&mut m, 25, 0);

        assert_eq!(m.phase(), TurnPhase::Initial);
        assert!(actions.contains(&TurnAction::TearDownSession));
        // Entered from Initial, so nothing was externally visible.
        assert!(!actions
            .iter()
            .any(|a| matches!(a, TurnAction::PhaseChanged { .. })));
    }

    #[test]
    fn test_speaking_to_waiting_after_silence_window() {
        let mut m = machine();
        confirm_speaking(&mut m);

        // 24 silence frames: still speaking.
        feed_silence(&mut m, 24, 0);
        assert_eq!(m.phase(), TurnPhase::Speaking);

        // The 25th reaches 500 ms.
        let actions = m.on_frame(silence(25 * FRAME_MS));
        assert_eq!(m.phase(), TurnPhase::Waiting);
        assert!(actions.contains(&TurnAction::PhaseChanged {
            from: TurnPhase::Speaking,
            to: TurnPhase::Waiting,
        }));
    }

    #[test]
    fn test_waiting_voice_reenters_buffer_with_preroll() {
        let mut m = machine();
        confirm_speaking(&mut m);
        feed_silence(&mut m, 25, 0);
        assert_eq!(m.phase(), TurnPhase::Waiting);

        let actions = m.on_frame(voice());
        assert_eq!(m.phase(), TurnPhase::TransitionBuffer);
        assert_eq!(m.visible_phase(), TurnPhase::Waiting);
        assert!(actions.contains(&TurnAction::PrependPreRoll));
        assert!(!actions.contains(&TurnAction::StartSessionWithPreRoll));
    }

    #[test]
    fn test_waiting_buffer_timeout_returns_to_initial_visibly() {
        let mut m = machine();
        confirm_speaking(&mut m);
        feed_silence(&mut m, 25, 0);
        m.on_frame(voice());

        let actions = feed_silence(&mut m, 25, 0);
        assert_eq!(m.phase(), TurnPhase::Initial);
        assert!(actions.contains(&TurnAction::PhaseChanged {
            from: TurnPhase::Waiting,
            to: TurnPhase::Initial,
        }));
    }

    #[test]
    fn test_listening_voice_is_barge_in() {
        let mut m = machine();
        m.on_control(ControlEvent::PlaybackStarted);
        assert_eq!(m.phase(), TurnPhase::Listening);

        let actions = m.on_frame(voice());
        assert_eq!(m.phase(), TurnPhase::TransitionBuffer);
        assert_eq!(m.visible_phase(), TurnPhase::Listening);
        assert_eq!(
            actions,
            vec![
                TurnAction::RequestInterrupt,
                TurnAction::StartSessionWithPreRoll,
            ]
        );
    }

    #[test]
    fn test_playback_started_wins_over_frames() {
        // Control drained before the frame: the machine lands in Listening
        // and the voice frame becomes a barge-in rather than a new turn.
        let mut m = machine();
        confirm_speaking(&mut m);

        let actions = m.on_control(ControlEvent::PlaybackStarted);
        assert_eq!(m.phase(), TurnPhase::Listening);
        assert!(actions.contains(&TurnAction::TearDownSession));

        let actions = m.on_frame(voice());
        assert!(actions.contains(&TurnAction::RequestInterrupt));
    }

    #[test]
    fn test_playback_ended_then_voice_gives_user_the_floor() {
        let mut m = machine();
        m.on_control(ControlEvent::PlaybackStarted);

        let actions = m.on_control(ControlEvent::PlaybackEnded);
        assert_eq!(m.phase(), TurnPhase::Initial);
        assert!(actions.contains(&TurnAction::PhaseChanged {
            from: TurnPhase::Listening,
            to: TurnPhase::Initial,
        }));

        // The coinciding voice frame starts a fresh turn, no interrupt.
        let actions = m.on_frame(voice());
        assert_eq!(actions, vec![TurnAction::StartSessionWithPreRoll]);
    }

    #[test]
    fn test_playback_started_is_idempotent() {
        let mut m = machine();
        assert!(!m.on_control(ControlEvent::PlaybackStarted).is_empty());
        assert!(m.on_control(ControlEvent::PlaybackStarted).is_empty());
        assert_eq!(m.phase(), TurnPhase::Listening);
    }

    #[test]
    fn test_playback_ended_during_barge_in_probe_keeps_buffer() {
        let mut m = machine();
        m.on_control(ControlEvent::PlaybackStarted);
        m.on_frame(voice());
        assert_eq!(m.phase(), TurnPhase::TransitionBuffer);

        let actions = m.on_control(ControlEvent::PlaybackEnded);
        assert_eq!(m.phase(), TurnPhase::TransitionBuffer);
        assert_eq!(m.visible_phase(), TurnPhase::Initial);
        assert!(actions.contains(&TurnAction::PhaseChanged {
            from: TurnPhase::Listening,
            to: TurnPhase::Initial,
        }));
    }

    #[test]
    fn test_reset_from_speaking() {
        let mut m = machine();
        confirm_speaking(&mut m);

        let actions = m.on_control(ControlEvent::ResetToInitial);
        assert_eq!(m.phase(), TurnPhase::Initial);
        assert!(actions.contains(&TurnAction::CancelReply));
        assert!(actions.contains(&TurnAction::ClearSentences));
        assert!(actions.contains(&TurnAction::TearDownSession));
        assert!(actions.contains(&TurnAction::PhaseChanged {
            from: TurnPhase::Speaking,
            to: TurnPhase::Initial,
        }));
    }

    #[test]
    fn test_force_end_session_always_tears_down() {
        let mut m = machine();
        let actions = m.on_control(ControlEvent::ForceEndSession);
        assert!(actions.contains(&TurnAction::TearDownSession));
        assert_eq!(m.phase(), TurnPhase::Initial);
    }

    #[test]
    fn test_session_drained_returns_to_initial() {
        let mut m = machine();
        confirm_speaking(&mut m);

        let actions = m.on_session_drained();
        assert_eq!(m.phase(), TurnPhase::Initial);
        assert!(actions.contains(&TurnAction::PhaseChanged {
            from: TurnPhase::Speaking,
            to: TurnPhase::Initial,
        }));
        // No session, no effect.
        assert!(m.on_session_drained().is_empty());
    }

    #[test]
    fn test_phase_changes_never_name_the_buffer() {
        let mut m = machine();
        let mut all = Vec::new();
        all.extend(m.on_frame(voice()));
        all.extend(m.on_recognizer(&nonempty_partial(1)));
        all.extend(m.on_frame(voice()));
        all.extend(m.on_frame(voice()));
        all.extend(feed_silence(&mut m, 25, 0));
        all.extend(m.on_frame(voice()));
        all.extend(m.on_control(ControlEvent::PlaybackStarted));
        all.extend(m.on_frame(voice()));
        all.extend(m.on_control(ControlEvent::ResetToInitial));

        for action in all {
            if let TurnAction::PhaseChanged { from, to } = action {
                assert!(from.is_externally_visible(), "hidden phase exported: {from}");
                assert!(to.is_externally_visible(), "hidden phase exported: {to}");
            }
        }
    }
}
