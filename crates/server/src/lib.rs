//! Lumina server.
//!
//! Exposes the dialogue core over three sockets per session: an audio
//! ingress (binary PCM frames plus out-of-band JSON), a playback egress
//! (length-prefixed PCM), and a JSON control channel.

pub mod control;
pub mod http;
pub mod playback;
pub mod session;
pub mod state;
pub mod websocket;

pub use http::create_router;
pub use playback::PlaybackChannel;
pub use session::{DialogueSession, SessionManager};
pub use state::AppState;

use thiserror::Error;

/// Server errors.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("session error: {0}")]
    Session(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ServerError> for axum::http::StatusCode {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Session(_) => axum::http::StatusCode::NOT_FOUND,
            ServerError::WebSocket(_) => axum::http::StatusCode::BAD_REQUEST,
            ServerError::InvalidRequest(_) => axum::http::StatusCode::BAD_REQUEST,
            ServerError::Internal(_) => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
