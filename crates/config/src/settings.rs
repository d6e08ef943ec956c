//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub stt: SttConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub tts: TtsConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Validate settings, failing on the first invalid field
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_server()?;
        self.validate_auth()?;
        self.validate_rate_limit()?;
        self.validate_upstreams()?;
        self.validate_orchestrator()?;
        Ok(())
    }

    fn validate_server(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(invalid("server.port", "Port cannot be 0"));
        }
        if self.server.request_timeout_secs == 0 {
            return Err(invalid(
                "server.request_timeout_secs",
                "Timeout must be at least 1 second",
            ));
        }
        if self.server.request_id_header.trim().is_empty() {
            return Err(invalid("server.request_id_header", "Header name cannot be empty"));
        }
        if self.server.cors_enabled && self.server.cors_origins.is_empty() {
            tracing::warn!("CORS is enabled but no origins are configured; defaulting to localhost:3000");
        }
        Ok(())
    }

    fn validate_auth(&self) -> Result<(), ConfigError> {
        if self.auth.header_name.trim().is_empty() {
            return Err(invalid("auth.header_name", "Header name cannot be empty"));
        }
        if self.auth.enabled && self.auth.api_keys.iter().all(|k| k.trim().is_empty()) {
            return Err(invalid(
                "auth.api_keys",
                "At least one API key must be configured when auth is enabled",
            ));
        }
        Ok(())
    }

    fn validate_rate_limit(&self) -> Result<(), ConfigError> {
        let rl = &self.rate_limit;
        if rl.requests_per_window == 0 {
            return Err(invalid("rate_limit.requests_per_window", "Must be at least 1"));
        }
        if rl.window_seconds <= 0.0 || !rl.window_seconds.is_finite() {
            return Err(invalid(
                "rate_limit.window_seconds",
                format!("Must be positive, got {}", rl.window_seconds),
            ));
        }
        if rl.burst_multiplier <= 0.0 || !rl.burst_multiplier.is_finite() {
            return Err(invalid(
                "rate_limit.burst_multiplier",
                format!("Must be positive, got {}", rl.burst_multiplier),
            ));
        }
        Ok(())
    }

    fn validate_upstreams(&self) -> Result<(), ConfigError> {
        let clients = [
            ("stt", &self.stt.client),
            ("llm", &self.llm.client),
            ("tts", &self.tts.client),
        ];
        for (name, client) in clients {
            if client.endpoint.trim().is_empty() {
                return Err(invalid(format!("{}.endpoint", name), "Endpoint cannot be empty"));
            }
            if client.timeout_secs == 0 {
                return Err(invalid(
                    format!("{}.timeout_secs", name),
                    "Timeout must be at least 1 second",
                ));
            }
            if client.max_concurrent == 0 {
                return Err(invalid(
                    format!("{}.max_concurrent", name),
                    "Must allow at least 1 concurrent call",
                ));
            }
        }
        if self.tts.default_sample_rate == 0 {
            return Err(invalid("tts.default_sample_rate", "Sample rate cannot be 0"));
        }
        Ok(())
    }

    fn validate_orchestrator(&self) -> Result<(), ConfigError> {
        let o = &self.orchestrator;
        if o.stt_timeout_secs == 0 || o.llm_timeout_secs == 0 || o.tts_timeout_secs == 0 {
            return Err(invalid(
                "orchestrator",
                "Stage timeouts must be at least 1 second",
            ));
        }
        if o.channel_capacity == 0 {
            return Err(invalid("orchestrator.channel_capacity", "Must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Header used to propagate the request id
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,

    /// Overall deadline for one request, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_id_header() -> String {
    "X-Request-ID".to_string()
}
fn default_request_timeout() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_id_header: default_request_id_header(),
            request_timeout_secs: default_request_timeout(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

/// API key authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Header carrying the API key
    #[serde(default = "default_api_key_header")]
    pub header_name: String,

    /// Accepted keys. From the environment as a comma separated list.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Paths that bypass authentication and rate limiting
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_public_paths() -> Vec<String> {
    vec!["/health".to_string(), "/metrics".to_string()]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            header_name: default_api_key_header(),
            api_keys: Vec::new(),
            public_paths: default_public_paths(),
        }
    }
}

/// Token bucket rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Requests allowed per window
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,

    /// Window length in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: f64,

    /// Burst allowance (multiple of requests_per_window)
    #[serde(default = "default_burst_multiplier")]
    pub burst_multiplier: f64,
}

fn default_requests_per_window() -> u32 {
    120
}
fn default_window_seconds() -> f64 {
    60.0
}
fn default_burst_multiplier() -> f64 {
    1.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_window: default_requests_per_window(),
            window_seconds: default_window_seconds(),
            burst_multiplier: default_burst_multiplier(),
        }
    }
}

/// Connection settings shared by every upstream engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamClientConfig {
    /// Base URL of the engine
    pub endpoint: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// HTTP timeout per attempt, in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Concurrent calls allowed against this engine
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_upstream_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    2
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_concurrent() -> usize {
    8
}

impl UpstreamClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            timeout_secs: default_upstream_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_concurrent: default_max_concurrent(),
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SttProvider {
    /// Hosted OpenAI-compatible Whisper
    #[default]
    OpenAi,
    /// Local Whisper sidecar
    Sidecar,
}

/// Speech-to-text engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default)]
    pub provider: SttProvider,

    #[serde(default = "default_stt_client")]
    pub client: UpstreamClientConfig,

    #[serde(default = "default_whisper_model")]
    pub model: String,

    #[serde(default = "default_whisper_response_format")]
    pub response_format: String,
}

fn default_stt_client() -> UpstreamClientConfig {
    UpstreamClientConfig::new("https://api.openai.com/v1")
}
fn default_whisper_model() -> String {
    "gpt-4o-mini-transcribe".to_string()
}
fn default_whisper_response_format() -> String {
    "verbose_json".to_string()
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: SttProvider::default(),
            client: default_stt_client(),
            model: default_whisper_model(),
            response_format: default_whisper_response_format(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    Ollama,
    /// OpenAI-compatible `/v1/completions` (llama.cpp server)
    OpenAiCompletions,
}

/// Text generation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,

    #[serde(default = "default_llm_client")]
    pub client: UpstreamClientConfig,

    /// Model requested from the engine
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Model id reported by `/v1/models`
    #[serde(default = "default_model_id")]
    pub model_id: String,
}

fn default_llm_client() -> UpstreamClientConfig {
    UpstreamClientConfig::new("http://localhost:11434").with_timeout(120)
}
fn default_llm_model() -> String {
    "gemma3:12b-it-qat".to_string()
}
fn default_model_id() -> String {
    "google/gemma-3-12b-it-qat-q4_0-gguf".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            client: default_llm_client(),
            model: default_llm_model(),
            model_id: default_model_id(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TtsProvider {
    #[default]
    OpenAudio,
    /// OpenAI-compatible `/audio/speech`
    OpenAiSpeech,
}

/// Text-to-speech engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default)]
    pub provider: TtsProvider,

    #[serde(default = "default_tts_client")]
    pub client: UpstreamClientConfig,

    /// Synthesis path relative to the endpoint, provider default when unset
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default = "default_tts_format")]
    pub default_format: String,

    #[serde(default = "default_sample_rate")]
    pub default_sample_rate: u32,

    #[serde(default)]
    pub default_reference_id: Option<String>,

    #[serde(default = "default_true")]
    pub default_normalize: bool,

    #[serde(default = "default_voice")]
    pub default_voice: String,
}

fn default_tts_client() -> UpstreamClientConfig {
    UpstreamClientConfig::new("http://localhost:8000").with_timeout(120)
}
fn default_tts_format() -> String {
    "wav".to_string()
}
fn default_sample_rate() -> u32 {
    16_000
}
fn default_voice() -> String {
    "en_woman".to_string()
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: TtsProvider::default(),
            client: default_tts_client(),
            path: None,
            model: None,
            default_format: default_tts_format(),
            default_sample_rate: default_sample_rate(),
            default_reference_id: None,
            default_normalize: true,
            default_voice: default_voice(),
        }
    }
}

/// Dialogue orchestration limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_stt_timeout")]
    pub stt_timeout_secs: u64,

    #[serde(default = "default_stage_timeout")]
    pub llm_timeout_secs: u64,

    #[serde(default = "default_stage_timeout")]
    pub tts_timeout_secs: u64,

    /// Capacity of the channel between the orchestrator and the writer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_stt_timeout() -> u64 {
    60
}
fn default_stage_timeout() -> u64 {
    120
}
fn default_channel_capacity() -> usize {
    32
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stt_timeout_secs: default_stt_timeout(),
            llm_timeout_secs: default_stage_timeout(),
            tts_timeout_secs: default_stage_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON formatted logs
    #[serde(default)]
    pub log_json: bool,

    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
        }
    }
}

/// Load settings from files and environment
///
/// Sources, later ones overriding earlier ones:
/// - `config/default.{yaml,toml,json}` (optional)
/// - `config/{env}` (optional)
/// - `GATEWAY__*` environment variables, e.g. `GATEWAY__AUTH__ENABLED=true`
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("GATEWAY")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("auth.api_keys")
            .with_list_parse_key("auth.public_paths")
            .with_list_parse_key("server.cors_origins"),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}
