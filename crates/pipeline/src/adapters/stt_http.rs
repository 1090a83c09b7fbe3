//! HTTP recognizer adapter.
//!
//! Buffers PCM and posts it to a transcription sidecar in sub-second
//! batches. The sidecar answers each batch with the running partial and
//! any sentences it committed since the previous batch; a drain posts the
//! remainder with the final flag set.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use lumina_core::{Error, RecognizerBackend, Result, Transcript};

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct HttpRecognizerConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    /// PCM bytes accumulated before a batch is posted (default 500 ms).
    pub batch_bytes: usize,
    pub request_timeout: Duration,
}

impl Default for HttpRecognizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8090".to_string(),
            api_key: None,
            batch_bytes: 16_000,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl HttpRecognizerConfig {
    pub fn from_settings(settings: &lumina_config::RecognizerConfig) -> Self {
        Self {
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone(),
            ..Default::default()
        }
    }
}

#[derive(Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    sentences: Vec<String>,
}

#[derive(Default)]
struct SessionBuffers {
    pcm: Vec<u8>,
    pending_sentences: Vec<String>,
    vendor_seq: u64,
}

/// Batch-posting recognizer vendor adapter.
pub struct HttpRecognizer {
    client: Client,
    config: HttpRecognizerConfig,
    buffers: Mutex<SessionBuffers>,
}

impl HttpRecognizer {
    pub fn new(config: HttpRecognizerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            buffers: Mutex::new(SessionBuffers::default()),
        })
    }

    async fn post_batch(&self, pcm: Vec<u8>, is_final: bool) -> Result<TranscribeResponse> {
        let url = format!("{}/transcribe", self.config.endpoint);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "audio/pcm")
            .header("X-Final", if is_final { "1" } else { "0" })
            .body(pcm);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::TransientUpstream(format!("transcribe request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                Error::TransientUpstream(format!("transcribe endpoint {status}: {body}"))
            } else {
                Error::PermanentUpstream(format!("transcribe endpoint {status}: {body}"))
            });
        }

        response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("bad transcribe response: {e}")))
    }
}

#[async_trait]
impl RecognizerBackend for HttpRecognizer {
    async fn start_session(&self) -> Result<()> {
        // Readiness probe; a new session starts from empty buffers and a
        // fresh sequence.
        let url = format!("{}/health", self.config.endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::TransientUpstream(format!("recognizer unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::TransientUpstream(format!(
                "recognizer health check returned {}",
                response.status()
            )));
        }

        *self.buffers.lock() = SessionBuffers::default();
        Ok(())
    }

    async fn send_chunk(&self, pcm: &[u8]) -> Result<Option<Transcript>> {
        let batch = {
            let mut buffers = self.buffers.lock();
            buffers.pcm.extend_from_slice(pcm);
            if buffers.pcm.len() < self.config.batch_bytes {
                return Ok(None);
            }
            std::mem::take(&mut buffers.pcm)
        };

        let response = match self.post_batch(batch.clone(), false).await {
            Ok(response) => response,
            Err(e) => {
                // Put the batch back so a reconnect replays it.
                let mut buffers = self.buffers.lock();
                let mut restored = batch;
                restored.extend_from_slice(&buffers.pcm);
                buffers.pcm = restored;
                return Err(e);
            }
        };

        let mut buffers = self.buffers.lock();
        buffers.pending_sentences.extend(response.sentences);
        if response.text.is_empty() {
            Ok(None)
        } else {
            buffers.vendor_seq += 1;
            Ok(Some(Transcript::partial(response.text, buffers.vendor_seq)))
        }
    }

    async fn end_session(&self) -> Result<Option<Transcript>> {
        let remainder = std::mem::take(&mut self.buffers.lock().pcm);
        let response = self.post_batch(remainder, true).await?;

        let mut buffers = self.buffers.lock();
        buffers.pending_sentences.extend(response.sentences);
        if response.text.trim().is_empty() {
            Ok(None)
        } else {
            buffers.vendor_seq += 1;
            Ok(Some(Transcript::final_commit(
                response.text,
                buffers.vendor_seq,
            )))
        }
    }

    async fn poll_complete_sentences(&self) -> Vec<String> {
        std::mem::take(&mut self.buffers.lock().pending_sentences)
    }

    async fn clear_sentence_buffer(&self) {
        self.buffers.lock().pending_sentences.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings() {
        let settings = lumina_config::RecognizerConfig::default();
        let config = HttpRecognizerConfig::from_settings(&settings);
        assert_eq!(config.endpoint, settings.endpoint);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_response_parsing_defaults() {
        let parsed: TranscribeResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.text.is_empty());
        assert!(parsed.sentences.is_empty());

        let parsed: TranscribeResponse =
            serde_json::from_str(r#"{"text":"hel","sentences":["prior one."]}"#).unwrap();
        assert_eq!(parsed.text, "hel");
        assert_eq!(parsed.sentences.len(), 1);
    }

    #[tokio::test]
    async fn test_chunks_below_batch_size_buffer_locally() {
        let recognizer = HttpRecognizer::new(HttpRecognizerConfig::default()).unwrap();
        // Well under the batch threshold: no request is made.
        let result = recognizer.send_chunk(&[0u8; 640]).await.unwrap();
        assert!(result.is_none());
    }
}
