//! Speech endpoints
//!
//! - `POST /v1/speech-to-text`: multipart upload -> transcript JSON
//! - `POST /v1/text-to-speech`: JSON -> base64 audio, or a chunked audio body

use axum::{
    body::Body,
    extract::{multipart::MultipartRejection, rejection::JsonRejection, Multipart, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    Extension, Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Instant;

use voice_gateway_core::{AudioMetadata, RequestContext, Transcript, TranscriptionRequest, VoiceParams};
use voice_gateway_pipeline::{metrics::record_pipeline, SynthesisPayload};

use crate::error::ApiError;
use crate::state::AppState;

/// Uploaded file plus the text fields of a multipart form
#[derive(Debug, Default)]
pub(crate) struct UploadForm {
    pub audio: Option<Bytes>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub fields: HashMap<String, String>,
}

impl UploadForm {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Take the upload as a transcription request, rejecting empty files
    pub fn transcription_request(&mut self) -> Result<TranscriptionRequest, ApiError> {
        let audio = self
            .audio
            .take()
            .ok_or_else(|| ApiError::invalid_input("Missing audio file upload"))?;
        if audio.is_empty() {
            return Err(ApiError::invalid_input("Uploaded audio file was empty"));
        }
        let temperature = match self.field("temperature") {
            Some(raw) => Some(raw.parse::<f32>().map_err(|_| {
                ApiError::invalid_input(format!("Invalid temperature '{}'", raw))
            })?),
            None => None,
        };
        Ok(TranscriptionRequest {
            audio,
            filename: self.filename.take(),
            content_type: self.content_type.take(),
            language: self.field("language").map(str::to_string),
            prompt: self.field("prompt").map(str::to_string),
            response_format: self.field("response_format").map(str::to_string),
            temperature,
        })
    }
}

/// Read a multipart form, taking the first file found under `file_fields`
pub(crate) async fn read_form(
    multipart: Result<Multipart, MultipartRejection>,
    file_fields: &[&str],
) -> Result<UploadForm, ApiError> {
    let mut multipart =
        multipart.map_err(|e| ApiError::invalid_input(format!("Expected multipart form: {}", e)))?;
    let mut form = UploadForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::invalid_input(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if file_fields.contains(&name.as_str()) && form.audio.is_none() {
            form.filename = field.file_name().map(str::to_string);
            form.content_type = field.content_type().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::invalid_input(format!("Failed to read upload: {}", e)))?;
            form.audio = Some(bytes);
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::invalid_input(format!("Invalid field '{}': {}", name, e)))?;
            form.fields.insert(name, value);
        }
    }
    Ok(form)
}

pub async fn speech_to_text(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Transcript>, ApiError> {
    let mut form = read_form(multipart, &["file"]).await?;
    let request = form.transcription_request()?;

    let started = Instant::now();
    let result = state.orchestrator.transcribe(&ctx, request).await;
    record_pipeline("speech_to_text", started.elapsed(), result.is_ok());
    Ok(Json(result?))
}

/// Text-to-speech request body
#[derive(Debug, Deserialize)]
pub struct SynthesisRequest {
    #[serde(alias = "input")]
    pub text: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub voice: VoiceParams,
}

pub async fn text_to_speech(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<SynthesisRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::invalid_input(e.body_text()))?;
    if request.text.trim().is_empty() {
        return Err(ApiError::invalid_input("Text to synthesize is empty"));
    }

    let started = Instant::now();
    if request.stream {
        let result = state
            .orchestrator
            .synthesize_stream(&ctx, &request.text, &request.voice)
            .await;
        record_pipeline("text_to_speech_stream", started.elapsed(), result.is_ok());
        let stream = result?;

        // Dropping the body aborts the upstream synthesis
        let guard = ctx.drop_guard();
        let body = stream.chunks.map(move |chunk| {
            let _ = &guard;
            chunk
        });
        return Ok((audio_headers(&stream.metadata), Body::from_stream(body)).into_response());
    }

    let result = state
        .orchestrator
        .synthesize(&ctx, &request.text, &request.voice)
        .await;
    record_pipeline("text_to_speech", started.elapsed(), result.is_ok());
    let audio = result?;
    Ok(Json(SynthesisPayload {
        audio_base64: BASE64.encode(&audio.audio),
        metadata: audio.metadata,
    })
    .into_response())
}

fn audio_headers(metadata: &AudioMetadata) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut set = |name: HeaderName, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    };
    set(header::CONTENT_TYPE, &metadata.media_type);
    set(
        HeaderName::from_static("x-audio-format"),
        &metadata.response_format,
    );
    set(
        HeaderName::from_static("x-sample-rate"),
        &metadata.sample_rate.to_string(),
    );
    if let Some(reference_id) = &metadata.reference_id {
        set(HeaderName::from_static("x-reference-id"), reference_id);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_headers() {
        let headers = audio_headers(&AudioMetadata::new("mp3", 24_000, Some("amy".into())));
        assert_eq!(headers[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(headers["x-audio-format"], "mp3");
        assert_eq!(headers["x-sample-rate"], "24000");
        assert_eq!(headers["x-reference-id"], "amy");
    }

    #[test]
    fn test_synthesis_request_accepts_input_alias() {
        let request: SynthesisRequest =
            serde_json::from_str(r#"{"input": "hi", "format": "pcm", "sample_rate": 8000}"#).unwrap();
        assert_eq!(request.text, "hi");
        assert!(!request.stream);
        assert_eq!(request.voice.format.as_deref(), Some("pcm"));
        assert_eq!(request.voice.sample_rate, Some(8000));
    }

    #[test]
    fn test_empty_upload_rejected() {
        let mut form = UploadForm {
            audio: Some(Bytes::new()),
            ..Default::default()
        };
        let err = form.transcription_request().unwrap_err();
        assert_eq!(err.status().as_u16(), 400);
    }

    #[test]
    fn test_invalid_temperature_rejected() {
        let mut form = UploadForm {
            audio: Some(Bytes::from_static(b"RIFF")),
            ..Default::default()
        };
        form.fields.insert("temperature".into(), "warm".into());
        assert!(form.transcription_request().is_err());
    }
}
