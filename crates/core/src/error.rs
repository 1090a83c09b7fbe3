//! Error taxonomy shared across the workspace.

use thiserror::Error;

/// Classified failures.
///
/// Components retry `TransientUpstream` within their own budgets; anything
/// unhandled ends the current dialogue session without exiting the process.
/// `Cancelled` is never surfaced to the user.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Retryable upstream failure (brief disconnect, 5xx).
    #[error("transient upstream error: {0}")]
    TransientUpstream(String),

    /// The vendor rejected the request; retrying will not help.
    #[error("permanent upstream error: {0}")]
    PermanentUpstream(String),

    /// Malformed message from a vendor or client.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bounded operation ran out of time.
    #[error("timeout: {0}")]
    Timeout(&'static str),

    /// The operation was cancelled by its supervisor.
    #[error("cancelled")]
    Cancelled,

    /// A bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry within the caller's budget is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientUpstream(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::TransientUpstream("eof".into()).is_retryable());
        assert!(Error::Timeout("drain").is_retryable());
        assert!(!Error::PermanentUpstream("401".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }
}
