//! Centralized constants and default values.
//!
//! Single source of truth for timing, buffer, and audio parameters. Vendor
//! endpoints come from environment variables with local fallbacks; credentials
//! have no defaults and must be configured explicitly.

/// Audio capture parameters.
pub mod audio {
    /// Capture sample rate (Hz).
    pub const SAMPLE_RATE: u32 = 16_000;

    /// Frame duration (ms).
    pub const FRAME_MS: u32 = 20;

    /// Samples per frame at the canonical rate.
    pub const SAMPLES_PER_FRAME: usize = 320;

    /// Energy floor for the fallback voice activity decision (dBFS).
    /// Frames quieter than this are never voice.
    pub const ENERGY_FLOOR_DB: f32 = -45.0;
}

/// Turn-taking parameters.
pub mod turn {
    /// Voice frames retained before a recognition session starts.
    pub const PRE_ROLL_FRAMES: usize = 10;

    /// Contiguous silence frames that end Speaking.
    pub const MAX_SILENCE_FRAMES: u32 = 25;

    /// Maximum wait in the transition buffer for a non-empty partial (ms).
    pub const TRANSITION_BUFFER_TIMEOUT_MS: u32 = 500;

    /// Voice frames needed before the transition buffer confirms speech.
    pub const MIN_VOICE_FRAMES_TO_SPEAK: u32 = 3;
}

/// Recognition session parameters.
pub mod recognizer {
    /// Bound on establishing the upstream connection (ms).
    pub const SESSION_START_TIMEOUT_MS: u64 = 3_000;

    /// How long a drain waits for a late final (ms).
    pub const FINAL_DRAIN_TIMEOUT_MS: u64 = 1_000;

    /// Reconnect attempts before the session is declared failed.
    pub const MAX_RECONNECTS: u32 = 2;

    /// Initial reconnect backoff (ms); doubles per attempt.
    pub const RECONNECT_BACKOFF_MS: u64 = 200;

    /// Frames buffered while reconnecting before the session fails.
    pub const RECONNECT_BUFFER_FRAMES: usize = 100;
}

/// Reply generation parameters.
pub mod reply {
    /// Sentence queue poll interval (ms).
    pub const MONITOR_INTERVAL_MS: u64 = 100;

    /// Finalized sentences arriving within this window are merged (ms).
    pub const SENTENCE_MERGE_WINDOW_MS: u64 = 200;

    /// Bound on the full language-model call (ms).
    pub const LLM_TIMEOUT_MS: u64 = 15_000;

    /// Bound on one synthesis request (ms).
    pub const TTS_TIMEOUT_MS: u64 = 10_000;

    /// Bound on reading one synthesized audio chunk (ms).
    pub const TTS_CHUNK_TIMEOUT_MS: u64 = 5_000;
}

/// Event bus parameters.
pub mod bus {
    /// Per-subscriber queue depth before oldest events are dropped.
    pub const SUBSCRIBER_QUEUE_DEPTH: usize = 1024;
}

/// Vendor endpoints, overridable via environment.
pub mod endpoints {
    use once_cell::sync::Lazy;

    /// Language model endpoint (env: LUMINA_LLM_URL).
    pub static LLM_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("LUMINA_LLM_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
    });

    /// Recognizer endpoint (env: LUMINA_STT_URL).
    pub static RECOGNIZER_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("LUMINA_STT_URL").unwrap_or_else(|_| "http://localhost:8090".to_string())
    });

    /// Synthesizer endpoint (env: LUMINA_TTS_URL).
    pub static SYNTHESIZER_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("LUMINA_TTS_URL").unwrap_or_else(|_| "http://localhost:8091".to_string())
    });
}
