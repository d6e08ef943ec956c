//! OpenAudio (Fish Speech) synthesis client

use async_trait::async_trait;
use serde::Serialize;

use voice_gateway_config::TtsConfig;
use voice_gateway_core::{
    AudioMetadata, RequestContext, Stage, StageError, SynthesisStream, SynthesizedAudio,
    TextToSpeech, VoiceParams,
};

use super::{chunk_stream, decode_audio_response};
use crate::upstream::UpstreamClient;
use crate::PipelineError;

const DEFAULT_PATH: &str = "/v1/tts";

#[derive(Debug, Serialize)]
struct OpenAudioPayload<'a> {
    text: &'a str,
    format: String,
    streaming: bool,
    normalize: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    references: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

pub struct OpenAudioTts {
    upstream: UpstreamClient,
    path: String,
    default_format: String,
    default_sample_rate: u32,
    default_reference_id: Option<String>,
    default_normalize: bool,
}

impl OpenAudioTts {
    pub fn new(config: &TtsConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            upstream: UpstreamClient::new(Stage::Tts, &config.client)?,
            path: config.path.clone().unwrap_or_else(|| DEFAULT_PATH.to_string()),
            default_format: config.default_format.clone(),
            default_sample_rate: config.default_sample_rate,
            default_reference_id: config.default_reference_id.clone(),
            default_normalize: config.default_normalize,
        })
    }

    fn payload<'a>(&self, text: &'a str, params: &VoiceParams, streaming: bool) -> OpenAudioPayload<'a> {
        OpenAudioPayload {
            text,
            format: params
                .format
                .clone()
                .unwrap_or_else(|| self.default_format.clone()),
            streaming,
            normalize: params.normalize.unwrap_or(self.default_normalize),
            reference_id: params
                .reference_id
                .clone()
                .or_else(|| self.default_reference_id.clone()),
            sample_rate: params.sample_rate,
            references: params.references.clone(),
            top_p: params.top_p,
        }
    }

    async fn attempt(&self, payload: &OpenAudioPayload<'_>) -> Result<reqwest::Response, StageError> {
        self.upstream
            .send(self.upstream.post(&self.path).json(payload))
            .await
    }
}

#[async_trait]
impl TextToSpeech for OpenAudioTts {
    async fn synthesize(
        &self,
        ctx: &RequestContext,
        text: &str,
        params: &VoiceParams,
    ) -> Result<SynthesizedAudio, StageError> {
        if text.trim().is_empty() {
            return Err(StageError::invalid_input(Stage::Tts, "Text to synthesize is empty"));
        }
        let payload = self.payload(text, params, false);
        let requested = self.describe(params);
        tracing::debug!(
            request_id = %ctx.id(),
            format = %payload.format,
            reference_id = ?payload.reference_id,
            "Requesting OpenAudio synthesis"
        );
        ctx.bound(Stage::Tts, async {
            let _permit = ctx.acquire(Stage::Tts, &self.upstream.limiter).await?;
            let this = self;
            let body = &payload;
            let response = self
                .upstream
                .retry
                .run(ctx, Stage::Tts, move || async move { this.attempt(body).await })
                .await?;
            decode_audio_response(response, requested).await
        })
        .await
    }

    async fn synthesize_stream(
        &self,
        ctx: &RequestContext,
        text: &str,
        params: &VoiceParams,
    ) -> Result<SynthesisStream, StageError> {
        if text.trim().is_empty() {
            return Err(StageError::invalid_input(Stage::Tts, "Text to synthesize is empty"));
        }
        let payload = self.payload(text, params, true);
        let permit = ctx.acquire(Stage::Tts, &self.upstream.limiter).await?;
        let this = self;
        let body = &payload;
        let response = ctx
            .bound(
                Stage::Tts,
                self.upstream
                    .retry
                    .run(ctx, Stage::Tts, move || async move { this.attempt(body).await }),
            )
            .await?;
        Ok(SynthesisStream {
            metadata: self.describe(params),
            chunks: chunk_stream(ctx.clone(), response, permit),
        })
    }

    fn describe(&self, params: &VoiceParams) -> AudioMetadata {
        AudioMetadata::new(
            params
                .format
                .clone()
                .unwrap_or_else(|| self.default_format.clone()),
            params.sample_rate.unwrap_or(self.default_sample_rate),
            params
                .reference_id
                .clone()
                .or_else(|| self.default_reference_id.clone()),
        )
    }

    fn backend_name(&self) -> &str {
        "openaudio"
    }
}
