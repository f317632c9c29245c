//! Runtime settings, read once from the environment at startup.

use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Server and pipeline configuration. All knobs have working defaults; only
/// the provider credentials are genuinely deployment-specific.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bind address for the WebSocket listener.
    pub bind_addr: String,

    /// Deepgram API key for speech-to-text. Required for the real server.
    pub deepgram_api_key: Option<String>,
    /// Deepgram speech model.
    pub deepgram_model: String,

    /// OpenAI-compatible chat completions endpoint for intent classification.
    pub intent_endpoint: String,
    /// API key for the intent endpoint. Without it, classification is skipped.
    pub intent_api_key: Option<String>,
    /// Model name for intent classification.
    pub intent_model: String,
    /// Hard deadline for one classification call.
    pub classifier_timeout: Duration,

    /// Presentation lookup API base URL. Without it, an in-memory store
    /// seeded from `PODIUM_PRESENTATIONS` is used.
    pub presentation_api: Option<String>,
    /// Auth validation API base URL. Without it, only guest tokens work.
    pub auth_api: Option<String>,
    /// Local seed for the in-memory store, `id:total_slides` pairs
    /// separated by commas, e.g. `1:12,7:30`.
    pub presentation_seed: String,

    /// Minimum time between two accepted navigation commands.
    pub command_cooldown: Duration,
    /// Binary frames below this size are treated as silence by the server.
    pub server_min_chunk_bytes: usize,
    /// Sessions with no inbound frames for this long are torn down.
    pub idle_timeout: Duration,

    /// Client capture window length.
    pub capture_window: Duration,
    /// Captured windows below this size are dropped as silence.
    pub capture_min_chunk_bytes: usize,

    /// Client heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Reconnection backoff base delay.
    pub backoff_base: Duration,
    /// Reconnection backoff cap.
    pub backoff_cap: Duration,
    /// Consecutive failed attempts before surfacing a terminal error.
    pub backoff_max_attempts: u32,
}

impl Settings {
    pub fn from_env() -> Self {
        Settings {
            bind_addr: env_or("PODIUM_BIND", "127.0.0.1:8090".to_string()),
            deepgram_api_key: env_opt("PODIUM_DEEPGRAM_API_KEY"),
            deepgram_model: env_or("PODIUM_DEEPGRAM_MODEL", "nova-2".to_string()),
            intent_endpoint: env_or(
                "PODIUM_INTENT_ENDPOINT",
                "https://api.openai.com/v1/chat/completions".to_string(),
            ),
            intent_api_key: env_opt("PODIUM_INTENT_API_KEY"),
            intent_model: env_or("PODIUM_INTENT_MODEL", "gpt-4o-mini".to_string()),
            classifier_timeout: Duration::from_millis(env_or(
                "PODIUM_CLASSIFIER_TIMEOUT_MS",
                3000u64,
            )),
            presentation_api: env_opt("PODIUM_PRESENTATION_API"),
            auth_api: env_opt("PODIUM_AUTH_API"),
            presentation_seed: env_or("PODIUM_PRESENTATIONS", String::new()),
            command_cooldown: Duration::from_millis(env_or("PODIUM_COOLDOWN_MS", 2000u64)),
            server_min_chunk_bytes: env_or("PODIUM_SERVER_MIN_CHUNK_BYTES", 500usize),
            idle_timeout: Duration::from_secs(env_or("PODIUM_IDLE_TIMEOUT_SECS", 300u64)),
            capture_window: Duration::from_millis(env_or("PODIUM_CAPTURE_WINDOW_MS", 3000u64)),
            capture_min_chunk_bytes: env_or("PODIUM_CAPTURE_MIN_CHUNK_BYTES", 1000usize),
            heartbeat_interval: Duration::from_secs(env_or("PODIUM_HEARTBEAT_SECS", 30u64)),
            backoff_base: Duration::from_millis(env_or("PODIUM_BACKOFF_BASE_MS", 1000u64)),
            backoff_cap: Duration::from_millis(env_or("PODIUM_BACKOFF_CAP_MS", 16000u64)),
            backoff_max_attempts: env_or("PODIUM_BACKOFF_MAX_ATTEMPTS", 5u32),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        // Defaults only; does not consult the environment.
        Settings {
            bind_addr: "127.0.0.1:8090".to_string(),
            deepgram_api_key: None,
            deepgram_model: "nova-2".to_string(),
            intent_endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            intent_api_key: None,
            intent_model: "gpt-4o-mini".to_string(),
            classifier_timeout: Duration::from_secs(3),
            presentation_api: None,
            auth_api: None,
            presentation_seed: String::new(),
            command_cooldown: Duration::from_millis(2000),
            server_min_chunk_bytes: 500,
            idle_timeout: Duration::from_secs(300),
            capture_window: Duration::from_millis(3000),
            capture_min_chunk_bytes: 1000,
            heartbeat_interval: Duration::from_secs(30),
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(16000),
            backoff_max_attempts: 5,
        }
    }
}
