//! Playback egress.
//!
//! A length-prefixed binary stream of PCM chunks, server to client. Each
//! message is a 4-byte little-endian length followed by that many bytes of
//! PCM; a zero-length message signals end of reply.
//!
//! The channel buffers between the reply pipeline and the socket writer so
//! a barge-in can drop audio that was queued but not yet written.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use lumina_core::{CancelToken, PlaybackSink, Result};

enum PlaybackMessage {
    Chunk(Vec<u8>),
    EndOfReply,
}

/// Buffered playback sink with a detachable socket writer.
pub struct PlaybackChannel {
    queue: Mutex<VecDeque<PlaybackMessage>>,
    notify: Notify,
}

impl PlaybackChannel {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Frame one message: 4-byte LE length, then the payload.
    fn encode(payload: &[u8]) -> Vec<u8> {
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(payload);
        framed
    }

    /// Drive the socket writer until the stream closes or shutdown fires.
    pub async fn run_writer(
        self: Arc<Self>,
        mut sink: SplitSink<WebSocket, Message>,
        shutdown: CancelToken,
    ) {
        loop {
            let message = self.queue.lock().pop_front();
            let Some(message) = message else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.notify.notified() => continue,
                }
            };

            let framed = match &message {
                PlaybackMessage::Chunk(bytes) => Self::encode(bytes),
                PlaybackMessage::EndOfReply => Self::encode(&[]),
            };

            if let Err(e) = sink.send(Message::Binary(framed)).await {
                tracing::debug!(error = %e, "playback socket closed");
                break;
            }
        }
        tracing::debug!("playback writer stopped");
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Default for PlaybackChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlaybackSink for PlaybackChannel {
    async fn send_chunk(&self, chunk: &[i16]) -> Result<()> {
        let mut bytes = Vec::with_capacity(chunk.len() * 2);
        for sample in chunk {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        self.queue.lock().push_back(PlaybackMessage::Chunk(bytes));
        self.notify.notify_one();
        Ok(())
    }

    async fn end_of_reply(&self) -> Result<()> {
        self.queue.lock().push_back(PlaybackMessage::EndOfReply);
        self.notify.notify_one();
        Ok(())
    }

    async fn drop_buffered(&self) -> Result<()> {
        let dropped = {
            let mut queue = self.queue.lock();
            let before = queue.len();
            queue.retain(|m| !matches!(m, PlaybackMessage::Chunk(_)));
            before - queue.len()
        };
        if dropped > 0 {
            tracing::info!(dropped, "dropped buffered playback chunks");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefixes_length() {
        let framed = PlaybackChannel::encode(&[1, 2, 3]);
        assert_eq!(&framed[..4], &3u32.to_le_bytes());
        assert_eq!(&framed[4..], &[1, 2, 3]);

        let end = PlaybackChannel::encode(&[]);
        assert_eq!(end, vec![0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_drop_buffered_keeps_end_markers() {
        let channel = PlaybackChannel::new();
        channel.send_chunk(&[1, 2]).await.unwrap();
        channel.send_chunk(&[3, 4]).await.unwrap();
        channel.end_of_reply().await.unwrap();

        channel.drop_buffered().await.unwrap();
        assert_eq!(channel.queued(), 1, "only the end marker survives");
    }

    #[tokio::test]
    async fn test_chunk_bytes_are_little_endian() {
        let channel = PlaybackChannel::new();
        channel.send_chunk(&[0x0102]).await.unwrap();

        let message = channel.queue.lock().pop_front().unwrap();
        match message {
            PlaybackMessage::Chunk(bytes) => assert_eq!(bytes, vec![0x02, 0x01]),
            PlaybackMessage::EndOfReply => panic!("expected a chunk"),
        }
    }
}
