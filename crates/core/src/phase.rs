//! Conversational turn phase.

use serde::{Deserialize, Serialize};

/// The phase of the dialogue from the core's point of view.
///
/// Exactly one phase is current per session. `TransitionBuffer` is
/// probationary and never exported: observers keep seeing the phase the
/// machine occupied when it entered the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TurnPhase {
    /// No recognition session exists; waiting for the user.
    #[default]
    Initial,
    /// Probationary: audio is being forwarded but speech is unconfirmed.
    TransitionBuffer,
    /// The user is actively speaking.
    Speaking,
    /// End of utterance suspected; session held open for late finals.
    Waiting,
    /// The agent is playing audio.
    Listening,
}

impl TurnPhase {
    /// Whether observers outside the state machine may see this phase.
    pub fn is_externally_visible(&self) -> bool {
        !matches!(self, TurnPhase::TransitionBuffer)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Initial => "Initial",
            TurnPhase::TransitionBuffer => "TransitionBuffer",
            TurnPhase::Speaking => "Speaking",
            TurnPhase::Waiting => "Waiting",
            TurnPhase::Listening => "Listening",
        }
    }
}

impl std::fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility() {
        assert!(TurnPhase::Initial.is_externally_visible());
        assert!(TurnPhase::Speaking.is_externally_visible());
        assert!(!TurnPhase::TransitionBuffer.is_externally_visible());
    }

    #[test]
    fn test_wire_names_are_capitalized() {
        assert_eq!(
            serde_json::to_string(&TurnPhase::Speaking).unwrap(),
            "\"Speaking\""
        );
    }
}
