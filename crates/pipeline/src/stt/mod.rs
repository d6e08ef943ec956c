//! Speech-to-Text backends
//!
//! - `OpenAiWhisperStt`: hosted OpenAI-compatible `/audio/transcriptions`
//! - `SidecarWhisperStt`: local Whisper sidecar taking the raw upload

mod openai;
mod sidecar;

pub use openai::OpenAiWhisperStt;
pub use sidecar::SidecarWhisperStt;

use voice_gateway_core::{Stage, StageError, Transcript};

/// Decode a transcription body in the requested response format
///
/// Text formats (`text`, `srt`, `vtt`) carry no structure and become a bare
/// transcript.
pub(crate) fn parse_transcript(response_format: &str, body: &str) -> Result<Transcript, StageError> {
    match response_format {
        "text" | "srt" | "vtt" => Ok(Transcript::new(body.trim())),
        _ => serde_json::from_str(body).map_err(|e| {
            StageError::internal(Stage::Stt, format!("Malformed transcription response: {}", e))
        }),
    }
}
