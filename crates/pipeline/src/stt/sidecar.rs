//! Local Whisper sidecar
//!
//! The sidecar accepts the raw upload on `POST /transcribe` with options in
//! headers and answers with the transcript JSON.

use async_trait::async_trait;
use serde::Deserialize;

use voice_gateway_config::SttConfig;
use voice_gateway_core::{
    RequestContext, SpeechToText, Stage, StageError, Transcript, TranscriptSegment,
    TranscriptionRequest,
};

use crate::upstream::{transport_error, UpstreamClient};
use crate::PipelineError;

/// Response from the sidecar
#[derive(Debug, Deserialize)]
struct SidecarResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<TranscriptSegment>,
    #[serde(default)]
    error: Option<String>,
}

pub struct SidecarWhisperStt {
    upstream: UpstreamClient,
    model: String,
}

impl SidecarWhisperStt {
    pub fn new(config: &SttConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            upstream: UpstreamClient::new(Stage::Stt, &config.client)?,
            model: config.model.clone(),
        })
    }

    async fn attempt(&self, request: &TranscriptionRequest) -> Result<Transcript, StageError> {
        let mut builder = self
            .upstream
            .post("/transcribe")
            .header(
                reqwest::header::CONTENT_TYPE,
                request
                    .content_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            )
            .header("X-Model", self.model.as_str())
            .body(request.audio.clone());
        if let Some(language) = &request.language {
            builder = builder.header("X-Language", language.as_str());
        }
        if let Some(temperature) = request.temperature {
            builder = builder.header("X-Temperature", temperature.to_string());
        }

        let response = self.upstream.send(builder).await?;
        let result: SidecarResponse = response
            .json()
            .await
            .map_err(|e| transport_error(Stage::Stt, e))?;

        if let Some(error) = result.error {
            if result.text.is_empty() {
                return Err(StageError::invalid_input(Stage::Stt, error));
            }
            tracing::warn!("STT sidecar returned error alongside text: {}", error);
        }

        Ok(Transcript {
            text: result.text,
            language: result.language,
            segments: result.segments,
        })
    }
}

#[async_trait]
impl SpeechToText for SidecarWhisperStt {
    async fn transcribe(
        &self,
        ctx: &RequestContext,
        request: TranscriptionRequest,
    ) -> Result<Transcript, StageError> {
        if request.audio.is_empty() {
            return Err(StageError::invalid_input(Stage::Stt, "Uploaded audio is empty"));
        }
        ctx.bound(Stage::Stt, async {
            let _permit = ctx.acquire(Stage::Stt, &self.upstream.limiter).await?;
            let this = self;
            let req = &request;
            self.upstream
                .retry
                .run(ctx, Stage::Stt, move || async move { this.attempt(req).await })
                .await
        })
        .await
    }

    fn backend_name(&self) -> &str {
        "whisper_sidecar"
    }
}
