//! HTTP language model adapter.
//!
//! Speaks an Ollama-compatible streaming chat API: one POST per request,
//! NDJSON response chunks, one content token per line. Transient network
//! failures while establishing the stream are retried with exponential
//! backoff; mid-stream failures are surfaced to the orchestrator, which
//! owns the fallback behavior.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use lumina_core::{CancelToken, Error, LanguageModel, Result, TextChunk};

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct HttpLlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Retries for establishing the stream (not mid-stream).
    pub max_retries: u32,
    /// Initial backoff; doubles per retry.
    pub initial_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpLlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "qwen2.5:7b-instruct-q4_K_M".to_string(),
            api_key: None,
            max_tokens: 256,
            temperature: 0.7,
            max_retries: 2,
            initial_backoff: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpLlmConfig {
    pub fn from_settings(settings: &lumina_config::LlmConfig) -> Self {
        Self {
            endpoint: settings.endpoint.clone(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            ..Default::default()
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Deserialize)]
struct StreamChunk {
    message: StreamMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: String,
}

/// Streaming chat vendor adapter.
pub struct HttpLanguageModel {
    client: Client,
    config: HttpLlmConfig,
}

impl HttpLanguageModel {
    pub fn new(config: HttpLlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn api_url(&self) -> String {
        format!("{}/api/chat", self.config.endpoint)
    }

    async fn open_stream(&self, prompt: &str) -> Result<reqwest::Response> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: true,
            options: ChatOptions {
                temperature: self.config.temperature,
                num_predict: self.config.max_tokens as i32,
            },
        };

        let mut builder = self.client.post(self.api_url()).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::TransientUpstream(format!("chat request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                Error::TransientUpstream(format!("chat endpoint {status}: {body}"))
            } else {
                Error::PermanentUpstream(format!("chat endpoint {status}: {body}"))
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn generate(
        &self,
        prompt: &str,
        cancel: CancelToken,
        tx: mpsc::Sender<TextChunk>,
    ) -> Result<()> {
        // Retry only the stream establishment; once tokens flow, failures
        // belong to the caller's error handling.
        let mut backoff = self.config.initial_backoff;
        let mut response = None;
        for attempt in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.open_stream(prompt).await {
                Ok(r) => {
                    response = Some(r);
                    break;
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    tracing::warn!(
                        error = %e,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "chat stream open failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        let response = response.ok_or_else(|| {
            Error::TransientUpstream("chat stream retries exhausted".to_string())
        })?;

        let mut stream = response.bytes_stream();
        let mut line_buffer = String::new();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let bytes =
                chunk.map_err(|e| Error::TransientUpstream(format!("chat stream read: {e}")))?;
            line_buffer.push_str(&String::from_utf8_lossy(&bytes));

            // NDJSON: complete lines only, carry the remainder.
            while let Some(newline) = line_buffer.find('\n') {
                let line: String = line_buffer.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let parsed: StreamChunk = serde_json::from_str(line)
                    .map_err(|e| Error::Protocol(format!("bad chat chunk: {e}")))?;

                if !parsed.message.content.is_empty() {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    if tx.send(parsed.message.content).await.is_err() {
                        // Receiver gone: the reply was superseded.
                        return Ok(());
                    }
                }

                if parsed.done {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings() {
        let mut settings = lumina_config::LlmConfig::default();
        settings.model = "test-model".to_string();
        settings.temperature = 0.2;

        let config = HttpLlmConfig::from_settings(&settings);
        assert_eq!(config.model, "test-model");
        assert_eq!(config.temperature, 0.2);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_stream_chunk_parsing() {
        let chunk: StreamChunk =
            serde_json::from_str(r#"{"message":{"content":"hi"},"done":false}"#).unwrap();
        assert_eq!(chunk.message.content, "hi");
        assert!(!chunk.done);

        let done: StreamChunk =
            serde_json::from_str(r#"{"message":{"content":""},"done":true}"#).unwrap();
        assert!(done.done);
    }
}
