//! Configuration for the Lumina dialogue engine.
//!
//! Settings are loaded once at startup (file + environment overrides) and
//! read-only thereafter. All timing and buffer parameters carry documented
//! defaults; vendor credentials do not.

pub mod constants;
pub mod settings;

pub use settings::{
    load_settings, ClassifierConfig, LlmConfig, ObservabilityConfig, RecognizerConfig, ReplyConfig,
    ServerConfig, Settings, SynthesizerConfig, TurnConfig,
};

use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
