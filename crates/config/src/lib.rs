//! Configuration management for the dialogue gateway
//!
//! Supports loading configuration from:
//! - YAML/TOML/JSON files under `config/`
//! - Environment variables (GATEWAY__ prefix)

pub mod settings;

pub use settings::{
    load_settings, AuthConfig, LlmConfig, LlmProvider, ObservabilityConfig, OrchestratorConfig,
    RateLimitConfig, ServerConfig, Settings, SttConfig, SttProvider, TtsConfig, TtsProvider,
    UpstreamClientConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(path) => ConfigError::FileNotFound(path),
            other => ConfigError::ParseError(other.to_string()),
        }
    }
}
