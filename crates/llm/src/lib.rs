//! LLM integration for the dialogue gateway
//!
//! Features:
//! - Ollama and OpenAI-compatible completions backends
//! - Streaming token generation
//! - Dialogue prompt construction

pub mod backend;
pub mod factory;
pub mod prompt;

pub use backend::{LlmBackendConfig, OllamaBackend, OpenAiCompletionsBackend};
pub use factory::create_language_model;
pub use prompt::{build_dialogue_prompt, NO_TRANSCRIPT_PLACEHOLDER};

use thiserror::Error;
use voice_gateway_core::{Stage, StageError};

/// LLM errors
#[derive(Error, Debug)]
pub enum LlmError {
    /// The engine rejected the request (4xx)
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else if err.is_decode() {
            LlmError::InvalidResponse(err.to_string())
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl From<LlmError> for StageError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Api { .. } => StageError::invalid_input(Stage::Llm, err.to_string()),
            LlmError::Network(msg) => StageError::unavailable(Stage::Llm, msg),
            LlmError::Timeout => StageError::timeout(Stage::Llm),
            LlmError::InvalidResponse(_) | LlmError::Configuration(_) => {
                StageError::internal(Stage::Llm, err.to_string())
            }
        }
    }
}
