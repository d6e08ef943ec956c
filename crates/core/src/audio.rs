//! Audio payload types and format helpers

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Default sample rate used when neither the caller nor the engine supplies one
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Map a response format to its media type
///
/// Unknown formats fall back to `application/octet-stream`.
pub fn media_type_for_format(format: &str) -> &'static str {
    match format.to_ascii_lowercase().as_str() {
        "pcm" => "audio/pcm",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

/// Format information describing synthesized audio
///
/// Emitted as the `metadata` event of a streamed dialogue and embedded in
/// buffered synthesis responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioMetadata {
    pub response_format: String,
    pub media_type: String,
    pub sample_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

impl AudioMetadata {
    pub fn new(response_format: impl Into<String>, sample_rate: u32, reference_id: Option<String>) -> Self {
        let response_format = response_format.into();
        let media_type = media_type_for_format(&response_format).to_string();
        Self {
            response_format,
            media_type,
            sample_rate,
            reference_id,
        }
    }
}

/// A fully buffered synthesis result
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub audio: Bytes,
    pub metadata: AudioMetadata,
}

impl SynthesizedAudio {
    pub fn new(audio: impl Into<Bytes>, metadata: AudioMetadata) -> Self {
        Self {
            audio: audio.into(),
            metadata,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_empty()
    }
}

/// Voice parameters forwarded to a TTS engine
///
/// Every field is optional; engines fill gaps from their configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceParams {
    #[serde(alias = "response_format")]
    pub format: Option<String>,
    pub sample_rate: Option<u32>,
    pub reference_id: Option<String>,
    pub normalize: Option<bool>,
    pub references: Vec<String>,
    pub top_p: Option<f32>,
    pub voice: Option<String>,
}

impl VoiceParams {
    /// Overlay `other` on top of `self`, keeping values `other` leaves unset
    pub fn merged_with(mut self, other: &VoiceParams) -> Self {
        if other.format.is_some() {
            self.format = other.format.clone();
        }
        if other.sample_rate.is_some() {
            self.sample_rate = other.sample_rate;
        }
        if other.reference_id.is_some() {
            self.reference_id = other.reference_id.clone();
        }
        if other.normalize.is_some() {
            self.normalize = other.normalize;
        }
        if !other.references.is_empty() {
            self.references = other.references.clone();
        }
        if other.top_p.is_some() {
            self.top_p = other.top_p;
        }
        if other.voice.is_some() {
            self.voice = other.voice.clone();
        }
        self
    }
}
