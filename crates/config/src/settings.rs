//! Main settings module.
//!
//! Configuration is loaded once at startup and read-only thereafter.
//! Priority: environment variables > config file > built-in defaults.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::constants::{audio, bus, endpoints, recognizer, reply, turn};
use crate::ConfigError;

/// Main application settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub turn: TurnConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub recognizer: RecognizerConfig,

    #[serde(default)]
    pub reply: ReplyConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub synthesizer: SynthesizerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Listener and bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-subscriber event queue depth before oldest events are dropped.
    #[serde(default = "default_queue_depth")]
    pub subscriber_queue_depth: usize,

    /// Maximum concurrent dialogue sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_queue_depth() -> usize {
    bus::SUBSCRIBER_QUEUE_DEPTH
}
fn default_max_sessions() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            subscriber_queue_depth: default_queue_depth(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// Turn-taking thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Voice frames retained before a session starts.
    #[serde(default = "default_pre_roll_frames")]
    pub pre_roll_frames: usize,

    /// Contiguous silence frames that end Speaking.
    #[serde(default = "default_max_silence_frames")]
    pub max_silence_frames: u32,

    /// Maximum wait in the transition buffer for a non-empty partial (ms).
    #[serde(default = "default_transition_buffer_timeout_ms")]
    pub transition_buffer_timeout_ms: u32,

    /// Voice frames needed before the transition buffer confirms speech.
    #[serde(default = "default_min_voice_frames")]
    pub min_voice_frames_to_speak: u32,
}

fn default_pre_roll_frames() -> usize {
    turn::PRE_ROLL_FRAMES
}
fn default_max_silence_frames() -> u32 {
    turn::MAX_SILENCE_FRAMES
}
fn default_transition_buffer_timeout_ms() -> u32 {
    turn::TRANSITION_BUFFER_TIMEOUT_MS
}
fn default_min_voice_frames() -> u32 {
    turn::MIN_VOICE_FRAMES_TO_SPEAK
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            pre_roll_frames: default_pre_roll_frames(),
            max_silence_frames: default_max_silence_frames(),
            transition_buffer_timeout_ms: default_transition_buffer_timeout_ms(),
            min_voice_frames_to_speak: default_min_voice_frames(),
        }
    }
}

/// Frame classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Energy floor for the fallback voice decision (dBFS).
    #[serde(default = "default_energy_floor_db")]
    pub energy_floor_db: f32,
}

fn default_energy_floor_db() -> f32 {
    audio::ENERGY_FLOOR_DB
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            energy_floor_db: default_energy_floor_db(),
        }
    }
}

/// Recognition session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerConfig {
    /// Vendor endpoint.
    #[serde(default = "default_recognizer_endpoint")]
    pub endpoint: String,

    /// Vendor credential. No default.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_session_start_timeout_ms")]
    pub session_start_timeout_ms: u64,

    #[serde(default = "default_final_drain_timeout_ms")]
    pub final_drain_timeout_ms: u64,

    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,

    /// Initial reconnect backoff (ms); doubles per attempt.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Frames buffered during reconnect before the session fails.
    #[serde(default = "default_reconnect_buffer_frames")]
    pub reconnect_buffer_frames: usize,
}

fn default_recognizer_endpoint() -> String {
    endpoints::RECOGNIZER_DEFAULT.clone()
}
fn default_session_start_timeout_ms() -> u64 {
    recognizer::SESSION_START_TIMEOUT_MS
}
fn default_final_drain_timeout_ms() -> u64 {
    recognizer::FINAL_DRAIN_TIMEOUT_MS
}
fn default_max_reconnects() -> u32 {
    recognizer::MAX_RECONNECTS
}
fn default_reconnect_backoff_ms() -> u64 {
    recognizer::RECONNECT_BACKOFF_MS
}
fn default_reconnect_buffer_frames() -> usize {
    recognizer::RECONNECT_BUFFER_FRAMES
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_recognizer_endpoint(),
            api_key: None,
            session_start_timeout_ms: default_session_start_timeout_ms(),
            final_drain_timeout_ms: default_final_drain_timeout_ms(),
            max_reconnects: default_max_reconnects(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            reconnect_buffer_frames: default_reconnect_buffer_frames(),
        }
    }
}

/// Reply pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    /// Sentence queue poll interval (ms).
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Finalized sentences arriving within this window merge (ms).
    #[serde(default = "default_sentence_merge_window_ms")]
    pub sentence_merge_window_ms: u64,

    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,

    #[serde(default = "default_tts_timeout_ms")]
    pub tts_timeout_ms: u64,

    /// Bound on reading one synthesized chunk (ms).
    #[serde(default = "default_tts_chunk_timeout_ms")]
    pub tts_chunk_timeout_ms: u64,

    /// Spoken when the language model fails.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
}

fn default_monitor_interval_ms() -> u64 {
    reply::MONITOR_INTERVAL_MS
}
fn default_sentence_merge_window_ms() -> u64 {
    reply::SENTENCE_MERGE_WINDOW_MS
}
fn default_llm_timeout_ms() -> u64 {
    reply::LLM_TIMEOUT_MS
}
fn default_tts_timeout_ms() -> u64 {
    reply::TTS_TIMEOUT_MS
}
fn default_tts_chunk_timeout_ms() -> u64 {
    reply::TTS_CHUNK_TIMEOUT_MS
}
fn default_fallback_reply() -> String {
    "Sorry, I didn't catch that. Could you say it again?".to_string()
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval_ms(),
            sentence_merge_window_ms: default_sentence_merge_window_ms(),
            llm_timeout_ms: default_llm_timeout_ms(),
            tts_timeout_ms: default_tts_timeout_ms(),
            tts_chunk_timeout_ms: default_tts_chunk_timeout_ms(),
            fallback_reply: default_fallback_reply(),
        }
    }
}

/// Language model vendor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Vendor credential. No default.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,

    /// System prompt prepended to every request.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_llm_endpoint() -> String {
    endpoints::LLM_DEFAULT.clone()
}
fn default_llm_model() -> String {
    "qwen2.5:7b-instruct-q4_K_M".to_string()
}
fn default_llm_max_tokens() -> u32 {
    256
}
fn default_llm_temperature() -> f32 {
    0.7
}
fn default_system_prompt() -> String {
    "You are a helpful voice assistant. Keep responses brief and natural; \
     they will be spoken aloud."
        .to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            api_key: None,
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// Synthesizer vendor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizerConfig {
    #[serde(default = "default_synthesizer_endpoint")]
    pub endpoint: String,

    /// Vendor credential. No default.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub voice_id: Option<String>,
}

fn default_synthesizer_endpoint() -> String {
    endpoints::SYNTHESIZER_DEFAULT.clone()
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_synthesizer_endpoint(),
            api_key: None,
            voice_id: None,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log filter, e.g. "info" or "lumina_pipeline=debug".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Validate cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.turn.pre_roll_frames == 0 {
            return Err(ConfigError::Invalid(
                "turn.pre_roll_frames must be at least 1".into(),
            ));
        }
        if self.turn.max_silence_frames == 0 {
            return Err(ConfigError::Invalid(
                "turn.max_silence_frames must be at least 1".into(),
            ));
        }
        if self.recognizer.reconnect_buffer_frames == 0 {
            return Err(ConfigError::Invalid(
                "recognizer.reconnect_buffer_frames must be at least 1".into(),
            ));
        }
        if self.reply.monitor_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "reply.monitor_interval_ms must be at least 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::Invalid(format!(
                "llm.temperature out of range: {}",
                self.llm.temperature
            )));
        }
        Ok(())
    }
}

/// Load settings from an optional file plus `LUMINA_*` environment overrides.
///
/// Nested fields use double underscores: `LUMINA_SERVER__PORT=9090`.
pub fn load_settings(path: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(File::with_name(path).required(false));
    }

    let raw = builder
        .add_source(Environment::with_prefix("LUMINA").separator("__"))
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let settings: Settings = raw
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    settings.validate()?;
    Ok(settings)
}
