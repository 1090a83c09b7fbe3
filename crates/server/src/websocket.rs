//! Audio ingress.
//!
//! A duplex WebSocket per session. Inbound binary messages carry raw PCM
//! (20 ms / 16 kHz mono / 16-bit LE frames; larger messages are split on
//! frame boundaries). Inbound text messages are out-of-band JSON:
//! `{"action":"stop"}` drains the recognizer, `{"silence_ms":N}` reports
//! client-side silence. Outbound text messages carry transcript updates.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use lumina_core::{AudioFrame, BusEvent, BYTES_PER_FRAME};
use lumina_pipeline::engine::EngineCommand;

use crate::session::DialogueSession;
use crate::state::AppState;

/// Out-of-band client messages on the audio socket.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AudioOob {
    Action { action: String },
    Silence { silence_ms: u32 },
}

/// Server-to-client messages on the audio socket.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AudioReply<'a> {
    Status { status: &'a str },
    Transcript { text: String, is_final: bool },
    Error { error: String },
}

/// Audio WebSocket upgrade handler.
pub async fn audio_ws(
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

    // Handshake: report ready only once the recognition stack has
    // acknowledged it can take a session.
    let handshake = match session.recognizer_ready().await {
        Ok(()) => AudioReply::Status { status: "ready" },
        Err(e) => {
            tracing::warn!(session_id = %session.id, error = %e, "recognition stack not ready");
            AudioReply::Error {
                error: e.to_string(),
            }
        }
    };
    let failed = matches!(handshake, AudioReply::Error { .. });
    let Ok(json) = serde_json::to_string(&handshake) else {
        return;
    };
    if sender.send(Message::Text(json)).await.is_err() || failed {
        return;
    }

    // Forward transcript updates to the client.
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::channel::<String>(64);
    let mut bus_sub = session.bus.subscribe();
    let transcript_tx = reply_tx.clone();
    let transcript_task = tokio::spawn(async move {
        while let Some(event) = bus_sub.recv().await {
            let reply = match event {
                BusEvent::PartialTranscript(t) if !t.is_empty() => Some(AudioReply::Transcript {
                    text: t.text,
                    is_final: false,
                }),
                BusEvent::SentenceFinalized { text, .. } => Some(AudioReply::Transcript {
                    text,
                    is_final: true,
                }),
                _ => None,
            };
            if let Some(reply) = reply {
                let json = match serde_json::to_string(&reply) {
                    Ok(json) => json,
                    Err(_) => continue,
                };
                if transcript_tx.send(json).await.is_err() {
                    break;
                }
            }
        }
    });

    let writer_task = tokio::spawn(async move {
        while let Some(json) = reply_rx.recv().await {
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // PCM bytes not yet forming a whole frame.
    let mut carry: Vec<u8> = Vec::with_capacity(BYTES_PER_FRAME);
    let mut frame_seq: u64 = 0;

    'recv: while let Some(message) = receiver.next().await {
        session.touch();
        match message {
            Ok(Message::Binary(data)) => {
                carry.extend_from_slice(&data);
                while carry.len() >= BYTES_PER_FRAME {
                    let frame_bytes: Vec<u8> = carry.drain(..BYTES_PER_FRAME).collect();
                    let frame = AudioFrame::from_pcm_bytes(&frame_bytes, frame_seq);
                    frame_seq += 1;
                    if session
                        .send_command(EngineCommand::Frame(frame))
                        .await
                        .is_err()
                    {
                        tracing::warn!(session_id = %session.id, "engine gone, closing audio socket");
                        break 'recv;
                    }
                }
            }
            Ok(Message::Text(text)) => {
                handle_oob(&session, &text, &reply_tx).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(session_id = %session.id, error = %e, "audio socket error");
                break;
            }
        }
    }

    transcript_task.abort();
    writer_task.abort();
    tracing::info!(session_id = %session.id, frames = frame_seq, "audio socket closed");
}

async fn handle_oob(
    session: &Arc<DialogueSession>,
    text: &str,
    reply_tx: &tokio::sync::mpsc::Sender<String>,
) {
    let parsed: AudioOob = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(session_id = %session.id, error = %e, "unparseable out-of-band message");
            return;
        }
    };

    match parsed {
        AudioOob::Action { action } if action == "stop" => {
            match session.stop_recognition().await {
                Ok(Some(final_transcript)) => {
                    let reply = AudioReply::Transcript {
                        text: final_transcript.text,
                        is_final: true,
                    };
                    if let Ok(json) = serde_json::to_string(&reply) {
                        let _ = reply_tx.send(json).await;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let reply = AudioReply::Error {
                        error: e.to_string(),
                    };
                    if let Ok(json) = serde_json::to_string(&reply) {
                        let _ = reply_tx.send(json).await;
                    }
                }
            }
        }
        AudioOob::Action { action } => {
            tracing::debug!(session_id = %session.id, action = %action, "unknown action");
        }
        AudioOob::Silence { silence_ms } => {
            let _ = session
                .send_command(EngineCommand::ClientSilence(silence_ms))
                .await;
        }
    }
}
