//! Core traits and types for the dialogue gateway
//!
//! This crate provides foundational types used across all other crates:
//! - Capability traits for pluggable STT, LLM and TTS backends
//! - Request context (correlation id, deadline, cancellation)
//! - Error taxonomy
//! - Transcript, audio and dialogue types

pub mod audio;
pub mod context;
pub mod dialogue;
pub mod error;
pub mod identity;
pub mod llm_types;
pub mod retry;
pub mod traits;
pub mod transcript;

pub use audio::{media_type_for_format, AudioMetadata, SynthesizedAudio, VoiceParams};
pub use context::RequestContext;
pub use dialogue::{DialogueOutcome, DialogueRequest, StageResult};
pub use error::{AuthFailure, Error, Result, Stage, StageError, StageErrorKind};
pub use identity::RequestIdentity;
pub use llm_types::SamplingParams;
pub use retry::RetryPolicy;
pub use transcript::{Transcript, TranscriptSegment};

pub use traits::{
    AudioStream, LanguageModel, SpeechToText, SynthesisStream, TextToSpeech, TokenStream,
    TranscriptionRequest,
};
