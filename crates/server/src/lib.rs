//! Dialogue Gateway Server
//!
//! HTTP, NDJSON and WebSocket front end for the dialogue pipeline, with API
//! key authentication, per-identity rate limiting and Prometheus metrics.

pub mod auth;
pub mod dialogue;
pub mod error;
pub mod generate;
pub mod http;
pub mod metrics;
pub mod rate_limit;
pub mod request_context;
pub mod speech;
pub mod state;
pub mod websocket;

pub use auth::{auth_middleware, Authenticator};
pub use error::ApiError;
pub use http::create_router;
pub use metrics::init_metrics;
pub use rate_limit::{Admission, BucketKey, BucketRegistry, RateLimiter, TokenBucket};
pub use state::AppState;

use thiserror::Error;
use voice_gateway_config::ConfigError;
use voice_gateway_llm::LlmError;
use voice_gateway_pipeline::PipelineError;

/// Startup errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("LLM backend error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
