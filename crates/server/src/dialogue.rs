//! Dialogue endpoint
//!
//! `POST /v1/dialogue` runs STT -> LLM -> TTS over one uploaded clip and
//! answers either with a single JSON document or an NDJSON event stream.

use axum::{
    body::Body,
    extract::{multipart::MultipartRejection, Multipart, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Extension, Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use voice_gateway_core::{
    AudioMetadata, DialogueOutcome, DialogueRequest, RequestContext, SamplingParams, Transcript,
    VoiceParams,
};
use voice_gateway_pipeline::{dialogue_events, ndjson_body, ErrorPayload};

use crate::error::ApiError;
use crate::speech::{read_form, UploadForm};
use crate::state::AppState;

const NDJSON: &str = "application/x-ndjson";

/// Buffered dialogue response
#[derive(Debug, Serialize)]
pub struct DialogueResponse {
    pub transcript: Transcript,
    pub response_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
    #[serde(flatten)]
    pub metadata: AudioMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_error: Option<ErrorPayload>,
}

impl From<DialogueOutcome> for DialogueResponse {
    fn from(outcome: DialogueOutcome) -> Self {
        Self {
            audio_base64: outcome.audio.as_ref().map(|a| BASE64.encode(&a.audio)),
            audio_error: outcome.audio_error.as_ref().map(ErrorPayload::from),
            transcript: outcome.transcript,
            response_text: outcome.response_text,
            metadata: outcome.metadata,
        }
    }
}

pub async fn dialogue(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let mut form = read_form(multipart, &["file", "audio"]).await?;
    let request = dialogue_request(&mut form)?;

    tracing::info!(
        request_id = ctx.id(),
        bytes = request.audio.audio.len(),
        stream_audio = request.stream_audio,
        "Starting dialogue"
    );

    if request.stream_audio {
        let metadata = state.orchestrator.describe_audio(&request.voice);
        let results = state.orchestrator.run(ctx.clone(), request);
        let events = dialogue_events(ctx, metadata, results);
        let mut response = Body::from_stream(ndjson_body(events)).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON));
        return Ok(response);
    }

    let outcome = state.orchestrator.run_buffered(&ctx, request).await?;
    Ok(Json(DialogueResponse::from(outcome)).into_response())
}

/// Assemble a dialogue request from the form fields
fn dialogue_request(form: &mut UploadForm) -> Result<DialogueRequest, ApiError> {
    let audio = form.transcription_request()?;
    let stream_audio = match form.field("stream_audio") {
        Some(raw) => parse_bool(raw).ok_or_else(|| {
            ApiError::invalid_input(format!("Invalid stream_audio value '{}'", raw))
        })?,
        None => false,
    };

    let sampling: SamplingParams =
        overrides(form.field("generation_config"), "generation_config", &["prompt"])?;
    sampling.validate()?;
    let voice: VoiceParams =
        overrides(form.field("synthesis_config"), "synthesis_config", &["text", "stream"])?;

    Ok(DialogueRequest {
        audio,
        instructions: form.field("instructions").map(str::to_string),
        stream_audio,
        sampling,
        voice,
    })
}

/// Parse an optional JSON object of overrides
///
/// Null values and the `reserved` keys are dropped before deserializing, so
/// they fall back to defaults.
fn overrides<T: DeserializeOwned>(
    raw: Option<&str>,
    field: &str,
    reserved: &[&str],
) -> Result<T, ApiError> {
    let mut object = match raw {
        None => Map::new(),
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(object)) => object,
            Ok(_) => {
                return Err(ApiError::invalid_input(format!(
                    "{} must be a JSON object",
                    field
                )))
            }
            Err(e) => {
                return Err(ApiError::invalid_input(format!(
                    "{} is not valid JSON: {}",
                    field, e
                )))
            }
        },
    };
    object.retain(|key, value| !value.is_null() && !reserved.contains(&key.as_str()));

    serde_json::from_value(Value::Object(object))
        .map_err(|e| ApiError::invalid_input(format!("Invalid {}: {}", field, e)))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
