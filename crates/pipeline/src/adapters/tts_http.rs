//! HTTP synthesizer adapter.
//!
//! Posts text to a synthesis service and streams the PCM response body
//! back as audio chunks. The response is raw 16 kHz mono 16-bit PCM;
//! network chunking decides chunk boundaries, with odd trailing bytes
//! carried into the next chunk.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

use lumina_core::{AudioChunk, CancelToken, Error, Result, SpeechSynthesizer};

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct HttpSynthesizerConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub voice_id: Option<String>,
    pub request_timeout: Duration,
}

impl Default for HttpSynthesizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8091".to_string(),
            api_key: None,
            voice_id: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpSynthesizerConfig {
    pub fn from_settings(settings: &lumina_config::SynthesizerConfig) -> Self {
        Self {
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone(),
            voice_id: settings.voice_id.clone(),
            ..Default::default()
        }
    }
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice_id: Option<&'a str>,
}

/// Streaming synthesis vendor adapter.
pub struct HttpSynthesizer {
    client: Client,
    config: HttpSynthesizerConfig,
}

impl HttpSynthesizer {
    pub fn new(config: HttpSynthesizerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        cancel: CancelToken,
        tx: mpsc::Sender<AudioChunk>,
    ) -> Result<()> {
        let url = format!("{}/synthesize", self.config.endpoint);
        let request = SynthesizeRequest {
            text,
            voice_id: self.config.voice_id.as_deref(),
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::TransientUpstream(format!("synthesis request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                Error::TransientUpstream(format!("synthesis endpoint {status}: {body}"))
            } else {
                Error::PermanentUpstream(format!("synthesis endpoint {status}: {body}"))
            });
        }

        let mut stream = response.bytes_stream();
        let mut carry: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let bytes = chunk
                .map_err(|e| Error::TransientUpstream(format!("synthesis stream read: {e}")))?;

            carry.extend_from_slice(&bytes);
            let usable = carry.len() - (carry.len() % 2);
            if usable == 0 {
                continue;
            }

            let samples: AudioChunk = carry[..usable]
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            carry.drain(..usable);

            if samples.is_empty() {
                continue;
            }
            if tx.send(samples).await.is_err() {
                // Receiver gone: the reply was superseded.
                return Ok(());
            }
        }

        if !carry.is_empty() {
            tracing::warn!(bytes = carry.len(), "synthesis stream ended mid-sample");
        }
        Ok(())
    }
}
