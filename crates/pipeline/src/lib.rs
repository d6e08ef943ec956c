//! Dialogue pipeline
//!
//! Features:
//! - Hosted and sidecar Whisper STT backends
//! - OpenAudio and OpenAI-compatible TTS backends
//! - STT -> LLM -> TTS orchestration with per-stage timeouts
//! - NDJSON / WebSocket event multiplexing

pub mod factory;
pub mod metrics;
pub mod multiplexer;
pub mod orchestrator;
pub mod stt;
pub mod tts;
mod upstream;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use factory::{create_stt, create_tts};
pub use multiplexer::{dialogue_events, ndjson_body, ErrorPayload, StreamEvent, SynthesisPayload};
pub use orchestrator::{DialogueOrchestrator, StageTimeouts};
pub use stt::{OpenAiWhisperStt, SidecarWhisperStt};
pub use tts::{OpenAiSpeechTts, OpenAudioTts};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),
}
