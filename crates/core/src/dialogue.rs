//! Dialogue request, stage results and the aggregated outcome

use crate::audio::{AudioMetadata, SynthesizedAudio, VoiceParams};
use crate::error::StageError;
use crate::llm_types::SamplingParams;
use crate::traits::TranscriptionRequest;
use crate::transcript::Transcript;
use bytes::Bytes;

/// One STT -> LLM -> TTS round trip
#[derive(Debug, Clone, Default)]
pub struct DialogueRequest {
    pub audio: TranscriptionRequest,
    pub instructions: Option<String>,
    pub stream_audio: bool,
    pub sampling: SamplingParams,
    pub voice: VoiceParams,
}

/// Progress emitted by the orchestrator, in causal order
#[derive(Debug, Clone)]
pub enum StageResult {
    Transcript(Transcript),
    AssistantText(String),
    AudioChunk { bytes: Bytes, sequence: u64 },
    StageError(StageError),
}

/// Buffered result of a dialogue
///
/// Exactly one of `audio` and `audio_error` is set once synthesis was attempted.
#[derive(Debug, Clone)]
pub struct DialogueOutcome {
    pub transcript: Transcript,
    pub response_text: String,
    pub audio: Option<SynthesizedAudio>,
    pub audio_error: Option<StageError>,
    pub metadata: AudioMetadata,
}

impl DialogueOutcome {
    pub fn is_degraded(&self) -> bool {
        self.audio_error.is_some()
    }
}
