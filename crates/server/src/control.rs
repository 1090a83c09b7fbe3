//! Control channel.
//!
//! JSON messages, both directions, types case-sensitive. Inbound:
//! `reset`, `end_session`, `playback_started`, `playback_ended`,
//! `interrupt`. Outbound: `phase_changed` with the externally visible
//! phase. Handling is idempotent; a repeated `playback_started` while
//! already Listening changes nothing.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use lumina_core::{BusEvent, ControlEvent, TurnPhase};

use crate::session::DialogueSession;
use crate::state::AppState;

/// Inbound control messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    Reset,
    EndSession,
    PlaybackStarted,
    PlaybackEnded,
    Interrupt,
}

impl From<ControlMessage> for ControlEvent {
    fn from(message: ControlMessage) -> Self {
        match message {
            ControlMessage::Reset => ControlEvent::ResetToInitial,
            ControlMessage::EndSession => ControlEvent::ForceEndSession,
            ControlMessage::PlaybackStarted => ControlEvent::PlaybackStarted,
            ControlMessage::PlaybackEnded => ControlEvent::PlaybackEnded,
            ControlMessage::Interrupt => ControlEvent::InterruptRequested,
        }
    }
}

/// Outbound control messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlUpdate {
    PhaseChanged { phase: TurnPhase },
}

/// Control WebSocket upgrade handler.
pub async fn control_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, axum::http::StatusCode> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or(axum::http::StatusCode::NOT_FOUND)?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, session)))
}

async fn handle_socket(socket: WebSocket, session: Arc<DialogueSession>) {
    let (mut sender, mut receiver) = socket.split();

    // Push every visible phase change to this client.
    let mut bus_sub = session.bus.subscribe();
    let phase_task = tokio::spawn(async move {
        while let Some(event) = bus_sub.recv().await {
            if let BusEvent::PhaseChanged { to, .. } = event {
                let update = ControlUpdate::PhaseChanged { phase: to };
                let json = match serde_json::to_string(&update) {
                    Ok(json) => json,
                    Err(_) => continue,
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    while let Some(message) = receiver.next().await {
        session.touch();
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ControlMessage>(&text) {
                Ok(message) => {
                    let event = ControlEvent::from(message);
                    tracing::debug!(session_id = %session.id, ?event, "control event received");
                    if session.send_control(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(session_id = %session.id, error = %e, "bad control message");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(session_id = %session.id, error = %e, "control socket error");
                break;
            }
        }
    }

    phase_task.abort();
    tracing::info!(session_id = %session.id, "control socket closed");
}
