//! Error taxonomy shared by every gateway crate

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A dialogue pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Stt,
    Llm,
    Tts,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Stt => "stt",
            Stage::Llm => "llm",
            Stage::Tts => "tts",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// The stage exceeded its deadline
    Timeout,
    /// Connectivity failure or upstream 5xx
    Unavailable,
    /// The engine rejected the payload
    InvalidInput,
    /// The owning request was cancelled
    Cancelled,
    /// Unexpected response or decode failure
    Internal,
}

impl StageErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageErrorKind::Timeout => "timeout",
            StageErrorKind::Unavailable => "unavailable",
            StageErrorKind::InvalidInput => "invalid_input",
            StageErrorKind::Cancelled => "cancelled",
            StageErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single capability call, tagged with the stage it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{stage} {kind}: {message}")]
pub struct StageError {
    pub stage: Stage,
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(stage: Stage, kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(stage: Stage) -> Self {
        Self::new(stage, StageErrorKind::Timeout, format!("{} stage timed out", stage))
    }

    pub fn unavailable(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, StageErrorKind::Unavailable, message)
    }

    pub fn invalid_input(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, StageErrorKind::InvalidInput, message)
    }

    pub fn cancelled(stage: Stage) -> Self {
        Self::new(stage, StageErrorKind::Cancelled, "request cancelled")
    }

    pub fn internal(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, StageErrorKind::Internal, message)
    }

    /// Whether an adapter may retry the call that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            StageErrorKind::Unavailable | StageErrorKind::Timeout
        )
    }
}

/// Why an authentication check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthFailure {
    /// No API key header on the request
    Missing,
    /// The supplied key is not in the configured set
    Invalid,
}

impl AuthFailure {
    pub fn message(&self) -> &'static str {
        match self {
            AuthFailure::Missing => "missing API key",
            AuthFailure::Invalid => "invalid API key",
        }
    }
}

/// Gateway error taxonomy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("unauthorized: {}", .0.message())]
    Unauthorized(AuthFailure),

    #[error("rate limit exceeded, retry after {retry_after_secs:.2}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("{stage} timed out: {message}")]
    UpstreamTimeout { stage: Stage, message: String },

    #[error("{stage} unavailable: {message}")]
    UpstreamUnavailable { stage: Stage, message: String },

    #[error("invalid input: {message}")]
    InvalidInput {
        stage: Option<Stage>,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput {
            stage: None,
            message: message.into(),
        }
    }

    /// Wire name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Unauthorized(_) => "unauthorized",
            Error::RateLimited { .. } => "rate_limited",
            Error::UpstreamTimeout { .. } => "upstream_timeout",
            Error::UpstreamUnavailable { .. } => "upstream_unavailable",
            Error::InvalidInput { .. } => "invalid_input",
            Error::Internal(_) => "internal_error",
            Error::Cancelled => "cancelled",
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::UpstreamTimeout { stage, .. } | Error::UpstreamUnavailable { stage, .. } => {
                Some(*stage)
            }
            Error::InvalidInput { stage, .. } => *stage,
            _ => None,
        }
    }
}

impl From<StageError> for Error {
    fn from(err: StageError) -> Self {
        match err.kind {
            StageErrorKind::Timeout => Error::UpstreamTimeout {
                stage: err.stage,
                message: err.message,
            },
            StageErrorKind::Unavailable => Error::UpstreamUnavailable {
                stage: err.stage,
                message: err.message,
            },
            StageErrorKind::InvalidInput => Error::InvalidInput {
                stage: Some(err.stage),
                message: err.message,
            },
            StageErrorKind::Cancelled => Error::Cancelled,
            StageErrorKind::Internal => {
                Error::Internal(format!("{} stage: {}", err.stage, err.message))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
