//! Hosted Whisper via the OpenAI-compatible transcription API

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};

use voice_gateway_config::SttConfig;
use voice_gateway_core::{
    RequestContext, SpeechToText, Stage, StageError, Transcript, TranscriptionRequest,
};

use super::parse_transcript;
use crate::upstream::{transport_error, UpstreamClient};
use crate::PipelineError;

const TRANSCRIPTIONS_PATH: &str = "/audio/transcriptions";

/// Whisper over `POST {endpoint}/audio/transcriptions`
pub struct OpenAiWhisperStt {
    upstream: UpstreamClient,
    model: String,
    default_response_format: String,
}

impl OpenAiWhisperStt {
    pub fn new(config: &SttConfig) -> Result<Self, PipelineError> {
        if config.client.api_key.is_none() {
            tracing::warn!("Whisper backend configured without API key");
        }
        Ok(Self {
            upstream: UpstreamClient::new(Stage::Stt, &config.client)?,
            model: config.model.clone(),
            default_response_format: config.response_format.clone(),
        })
    }

    fn build_form(
        &self,
        request: &TranscriptionRequest,
        response_format: &str,
    ) -> Result<Form, StageError> {
        let filename = request
            .filename
            .clone()
            .unwrap_or_else(|| "audio.wav".to_string());
        let content_type = request
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");
        let file = Part::stream(request.audio.clone())
            .file_name(filename)
            .mime_str(content_type)
            .map_err(|e| {
                StageError::invalid_input(Stage::Stt, format!("Invalid content type: {}", e))
            })?;

        let mut form = Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("response_format", response_format.to_string());
        if let Some(language) = request.language.as_ref().filter(|l| !l.is_empty()) {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = request.prompt.as_ref().filter(|p| !p.is_empty()) {
            form = form.text("prompt", prompt.clone());
        }
        if let Some(temperature) = request.temperature {
            form = form.text("temperature", temperature.to_string());
        }
        Ok(form)
    }

    async fn attempt(
        &self,
        request: &TranscriptionRequest,
        response_format: &str,
    ) -> Result<Transcript, StageError> {
        let form = self.build_form(request, response_format)?;
        let response = self
            .upstream
            .send(self.upstream.post(TRANSCRIPTIONS_PATH).multipart(form))
            .await?;
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(Stage::Stt, e))?;
        parse_transcript(response_format, &body)
    }
}

#[async_trait]
impl SpeechToText for OpenAiWhisperStt {
    async fn transcribe(
        &self,
        ctx: &RequestContext,
        request: TranscriptionRequest,
    ) -> Result<Transcript, StageError> {
        if request.audio.is_empty() {
            return Err(StageError::invalid_input(Stage::Stt, "Uploaded audio is empty"));
        }
        let response_format = request
            .response_format
            .clone()
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| self.default_response_format.clone());

        tracing::debug!(
            request_id = %ctx.id(),
            model = %self.model,
            bytes = request.audio.len(),
            "Dispatching Whisper transcription"
        );

        ctx.bound(Stage::Stt, async {
            let _permit = ctx.acquire(Stage::Stt, &self.upstream.limiter).await?;
            let this = self;
            let req = &request;
            let format = response_format.as_str();
            self.upstream
                .retry
                .run(ctx, Stage::Stt, move || async move {
                    this.attempt(req, format).await
                })
                .await
        })
        .await
    }

    fn backend_name(&self) -> &str {
        "openai_whisper"
    }
}
