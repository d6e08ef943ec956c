//! OpenAI-compatible speech synthesis (`/audio/speech`)
//!
//! Used for Higgs Audio and other servers exposing the OpenAI speech API.

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

const DEFAULT_PATH: &str = "/audio/speech";
const DEFAULT_MODEL: &str = "higgs-audio-v2-generation-3B-base";
const DEFAULT_FORMAT: &str = "pcm";

#[derive(Debug, Serialize)]
struct SpeechPayload<'a> {
    input: &'a str,
    voice: String,
    model: &'a str,
    response_format: String,
    sample_rate: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

pub struct OpenAiSpeechTts {
    upstream: UpstreamClient,
    path: String,
    model: String,
    default_voice: String,
    default_sample_rate: u32,
}

impl OpenAiSpeechTts {
    pub fn new(config: &TtsConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            upstream: UpstreamClient::new(Stage::Tts, &config.client)?,
            path: config.path.clone().unwrap_or_else(|| DEFAULT_PATH.to_string()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            default_voice: config.default_voice.clone(),
            default_sample_rate: config.default_sample_rate,
        })
    }

    fn payload<'a>(&'a self, text: &'a str, params: &VoiceParams, stream: bool) -> SpeechPayload<'a> {
        SpeechPayload {
            input: text,
            voice: params
                .voice
                .clone()
                .unwrap_or_else(|| self.default_voice.clone()),
            model: &self.model,
            response_format: params
                .format
                .clone()
                .unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
            sample_rate: params.sample_rate.unwrap_or(self.default_sample_rate),
            stream,
        }
    }

    async fn attempt(&self, payload: &SpeechPayload<'_>) -> Result<reqwest::Response, StageError> {
        self.upstream
            .send(self.upstream.post(&self.path).json(payload))
            .await
    }
}

#[async_trait]
impl TextToSpeech for OpenAiSpeechTts {
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
                .unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
            params.sample_rate.unwrap_or(self.default_sample_rate),
            None,
        )
    }

    fn backend_name(&self) -> &str {
        "openai_speech"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use std::time::Duration;
    use voice_gateway_config::{TtsProvider, UpstreamClientConfig};
    use voice_gateway_core::StageErrorKind;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn tts(endpoint: String) -> OpenAiSpeechTts {
        let mut client = UpstreamClientConfig::new(endpoint);
        client.max_retries = 0;
        OpenAiSpeechTts::new(&TtsConfig {
            provider: TtsProvider::OpenAiSpeech,
            client,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_payload_defaults() {
        let tts = tts("http://localhost:8000".to_string());
        let payload = serde_json::to_value(tts.payload("hi", &VoiceParams::default(), false)).unwrap();
        assert_eq!(payload["voice"], "en_woman");
        assert_eq!(payload["model"], DEFAULT_MODEL);
        assert_eq!(payload["response_format"], "pcm");
        assert!(payload.get("stream").is_none());

        let streaming = serde_json::to_value(tts.payload("hi", &VoiceParams::default(), true)).unwrap();
        assert_eq!(streaming["stream"], true);
    }

    #[tokio::test]
    async fn test_echoes_requested_format() {
        let router = Router::new().route(
            "/audio/speech",
            post(|Json(body): Json<serde_json::Value>| async move {
                Json(serde_json::json!({
                    "audio": "AAAA",
                    "response_format": body["response_format"],
                    "sample_rate": body["sample_rate"],
                }))
            }),
        );
        let tts = tts(serve(router).await);
        let ctx = RequestContext::new("h", Duration::from_secs(5));
        let params = VoiceParams {
            format: Some("wav".to_string()),
            sample_rate: Some(24_000),
            ..Default::default()
        };
        let audio = tts.synthesize(&ctx, "hello", &params).await.unwrap();
        assert_eq!(audio.metadata.response_format, "wav");
        assert_eq!(audio.metadata.sample_rate, 24_000);
        assert_eq!(audio.audio.len(), 3);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_unavailable() {
        let router = Router::new().route(
            "/audio/speech",
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "loading") }),
        );
        let tts = tts(serve(router).await);
        let ctx = RequestContext::new("h", Duration::from_secs(5));
        let err = tts
            .synthesize(&ctx, "hello", &VoiceParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Unavailable);
        assert_eq!(err.stage, Stage::Tts);
    }
}
