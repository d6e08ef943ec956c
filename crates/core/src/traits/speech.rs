//! Speech processing traits

use crate::audio::{AudioMetadata, SynthesizedAudio, VoiceParams};
use crate::context::RequestContext;
use crate::error::StageError;
use crate::transcript::Transcript;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// Ordered audio chunks from a streaming synthesis
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Bytes, StageError>> + Send>>;

/// A streaming synthesis in progress
pub struct SynthesisStream {
    pub metadata: AudioMetadata,
    pub chunks: AudioStream,
}

impl std::fmt::Debug for SynthesisStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisStream")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Uploaded audio plus transcription options
#[derive(Debug, Clone, Default)]
pub struct TranscriptionRequest {
    pub audio: Bytes,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub language: Option<String>,
    pub prompt: Option<String>,
    pub response_format: Option<String>,
    pub temperature: Option<f32>,
}

impl TranscriptionRequest {
    pub fn new(audio: impl Into<Bytes>) -> Self {
        Self {
            audio: audio.into(),
            ..Default::default()
        }
    }
}

/// Speech-to-Text interface
///
/// Implementations:
/// - `OpenAiWhisperStt` - hosted OpenAI-compatible `/audio/transcriptions`
/// - `SidecarWhisperStt` - local Whisper sidecar accepting raw audio
#[async_trait]
pub trait SpeechToText: Send + Sync + 'static {
    /// Transcribe a complete audio upload
    ///
    /// The call must stop promptly when `ctx` is cancelled.
    async fn transcribe(
        &self,
        ctx: &RequestContext,
        request: TranscriptionRequest,
    ) -> Result<Transcript, StageError>;

    /// Backend name for logging and metrics labels
    fn backend_name(&self) -> &str;
}

/// Text-to-Speech interface
///
/// Implementations:
/// - `OpenAudioTts` - OpenAudio `/v1/tts`
/// - `OpenAiSpeechTts` - OpenAI-compatible `/audio/speech`
#[async_trait]
pub trait TextToSpeech: Send + Sync + 'static {
    /// Synthesize text into one audio buffer
    async fn synthesize(
        &self,
        ctx: &RequestContext,
        text: &str,
        params: &VoiceParams,
    ) -> Result<SynthesizedAudio, StageError>;

    /// Start a streaming synthesis yielding ordered chunks
    ///
    /// The returned stream owns everything it needs; dropping it aborts the
    /// upstream call.
    async fn synthesize_stream(
        &self,
        ctx: &RequestContext,
        text: &str,
        params: &VoiceParams,
    ) -> Result<SynthesisStream, StageError>;

    /// Format metadata this backend will produce for `params`
    fn describe(&self, params: &VoiceParams) -> AudioMetadata;

    fn backend_name(&self) -> &str;
}
