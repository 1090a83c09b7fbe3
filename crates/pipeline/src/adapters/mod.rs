//! Vendor adapter implementations.
//!
//! Remote vendors sit behind the core adapter traits; these modules provide
//! the HTTP-speaking production adapters and scripted stand-ins for tests
//! and local development.

pub mod llm_http;
pub mod scripted;
pub mod stt_http;
pub mod tts_http;

pub use llm_http::{HttpLanguageModel, HttpLlmConfig};
pub use stt_http::{HttpRecognizer, HttpRecognizerConfig};
pub use tts_http::{HttpSynthesizer, HttpSynthesizerConfig};
