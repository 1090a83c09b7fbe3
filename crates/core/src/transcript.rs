//! Recognizer transcript types.

use serde::{Deserialize, Serialize};

/// One recognizer result, partial or final.
///
/// `sequence` is strictly increasing within a recognition session. A final
/// transcript is a terminal commit: later partials never revise it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
    pub sequence: u64,
}

impl Transcript {
    pub fn partial(text: impl Into<String>, sequence: u64) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            sequence,
        }
    }

    pub fn final_commit(text: impl Into<String>, sequence: u64) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            sequence,
        }
    }

    /// A partial with no content yet. Vendors emit these as keep-alives.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}
