//! Router assembly and session endpoints.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::session::VendorAdapters;
use crate::state::AppState;
use crate::{control, websocket};

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", axum::routing::delete(delete_session))
        .route("/ws/audio/:id", get(websocket::audio_ws))
        .route("/ws/playback/:id", get(playback_ws))
        .route("/ws/control/:id", get(control::control_ws))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn create_session(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, axum::http::StatusCode> {
    let adapters =
        VendorAdapters::from_settings(&state.settings).map_err(axum::http::StatusCode::from)?;

    let session = state
        .sessions
        .create(&state.settings, adapters)
        .map_err(axum::http::StatusCode::from)?;

    Ok(Json(serde_json::json!({
        "session_id": session.id,
        "audio_url": format!("/ws/audio/{}", session.id),
        "playback_url": format!("/ws/playback/{}", session.id),
        "control_url": format!("/ws/control/{}", session.id),
    })))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> axum::http::StatusCode {
    if state.sessions.get(&session_id).is_none() {
        return axum::http::StatusCode::NOT_FOUND;
    }
    state.sessions.remove(&session_id);
    axum::http::StatusCode::NO_CONTENT
}

/// Playback egress: unidirectional, server to client.
async fn playback_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, axum::http::StatusCode> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or(axum::http::StatusCode::NOT_FOUND)?;

    Ok(ws.on_upgrade(move |socket| async move {
        use futures::StreamExt;

        let (sink, mut stream) = socket.split();
        let writer_shutdown = lumina_core::CancelToken::new();
        let writer = tokio::spawn(
            session
                .playback
                .clone()
                .run_writer(sink, writer_shutdown.clone()),
        );

        // The client never sends data; wait for the close.
        while let Some(message) = stream.next().await {
            if matches!(message, Ok(axum::extract::ws::Message::Close(_)) | Err(_)) {
                break;
            }
        }

        writer_shutdown.cancel();
        let _ = writer.await;
        tracing::info!(session_id = %session.id, "playback socket closed");
    }))
}
