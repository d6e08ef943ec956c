//! Text generation and model listing
//!
//! Plain LLM access without the speech stages.

use axum::{
    body::Body,
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use voice_gateway_core::{Error, RequestContext, RequestIdentity, SamplingParams};
use voice_gateway_pipeline::{metrics::record_pipeline, ErrorPayload};

use crate::error::ApiError;
use crate::state::AppState;
use crate::websocket::{admit_socket, next_text, send_json, SessionContext};

#[derive(Debug, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(flatten)]
    pub sampling: SamplingParams,
}

impl GenerationRequest {
    fn validate(&self) -> Result<(), Error> {
        if self.prompt.trim().is_empty() {
            return Err(Error::invalid_input("prompt must not be empty"));
        }
        self.sampling.validate()
    }
}

#[derive(Debug, Serialize)]
pub struct GenerationResponse {
    pub generated_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct ModelListResponse {
    pub models: Vec<ModelInfo>,
}

fn parse_request(payload: Result<Json<GenerationRequest>, JsonRejection>) -> Result<GenerationRequest, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::invalid_input(e.body_text()))?;
    request.validate()?;
    Ok(request)
}

pub async fn generate(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let request = parse_request(payload)?;
    tracing::debug!(request_id = ctx.id(), prompt_chars = request.prompt.len(), "Generating text");

    let started = Instant::now();
    let result = state
        .orchestrator
        .generate(&ctx, &request.prompt, &request.sampling)
        .await;
    record_pipeline("generate", started.elapsed(), result.is_ok());
    Ok(Json(GenerationResponse {
        generated_text: result?,
    }))
}

/// Stream the accumulated completion as NDJSON lines
///
/// A failure after the first line is reported as a final `{"error": ...}` line.
pub async fn generate_stream(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = parse_request(payload)?;
    let mut tokens = state
        .orchestrator
        .generate_stream(&ctx, &request.prompt, &request.sampling)
        .await?;

    let guard = ctx.drop_guard();
    let body = async_stream::stream! {
        let _guard = guard;
        let started = Instant::now();
        let mut generated = String::new();
        let mut success = true;
        while let Some(token) = tokens.next().await {
            match token {
                Ok(token) => {
                    generated.push_str(&token);
                    yield Ok::<_, std::convert::Infallible>(ndjson_line(
                        &serde_json::json!({ "generated_text": generated }),
                    ));
                }
                Err(e) => {
                    success = false;
                    yield Ok(ndjson_line(&serde_json::json!({ "error": ErrorPayload::from(&e) })));
                    break;
                }
            }
        }
        record_pipeline("generate_stream", started.elapsed(), success);
    };

    let mut response = Body::from_stream(body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    Ok(response)
}

fn ndjson_line(value: &serde_json::Value) -> Bytes {
    let mut line = value.to_string();
    line.push('\n');
    Bytes::from(line)
}

/// `GET /v1/generate_ws`: one JSON generation request per frame, answered
/// with `{"token": ...}` frames and a closing `{"status": "done"}`
pub async fn generate_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
) -> Response {
    let admitted = admit_socket(&state, &identity);
    ws.on_upgrade(move |socket| async move {
        if let Some(socket) = admitted.accept(socket).await {
            generation_session(socket, state).await;
        }
    })
}

async fn generation_session(socket: WebSocket, state: AppState) {
    let session = SessionContext::new();
    let (mut sender, mut receiver) = socket.split();

    while let Some(text) = next_text(&mut receiver).await {
        let ctx = session.frame(state.request_timeout());
        let request = match serde_json::from_str::<GenerationRequest>(&text) {
            Ok(request) => request,
            Err(e) => {
                let err = Error::invalid_input(format!("Invalid generation request: {}", e));
                if send_json(&mut sender, &serde_json::json!({ "error": ErrorPayload::from(&err) })).await.is_err() {
                    break;
                }
                continue;
            }
        };
        if let Err(err) = request.validate() {
            if send_json(&mut sender, &serde_json::json!({ "error": ErrorPayload::from(&err) })).await.is_err() {
                break;
            }
            continue;
        }

        let mut tokens = match state
            .orchestrator
            .generate_stream(&ctx, &request.prompt, &request.sampling)
            .await
        {
            Ok(tokens) => tokens,
            Err(e) => {
                if send_json(&mut sender, &serde_json::json!({ "error": ErrorPayload::from(&e) })).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let mut closed = false;
        let mut failed = false;
        while let Some(token) = tokens.next().await {
            let frame = match token {
                Ok(token) => serde_json::json!({ "token": token }),
                Err(e) => {
                    failed = true;
                    serde_json::json!({ "error": ErrorPayload::from(&e) })
                }
            };
            if send_json(&mut sender, &frame).await.is_err() {
                closed = true;
                break;
            }
            if failed {
                break;
            }
        }
        if closed {
            break;
        }
        if !failed && send_json(&mut sender, &serde_json::json!({ "status": "done" })).await.is_err() {
            break;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

fn model_info(state: &AppState) -> ModelInfo {
    let llm = &state.config.llm;
    ModelInfo {
        id: llm.model_id.clone(),
        name: llm.model.clone(),
        description: format!(
            "{} served by the {} backend",
            llm.model,
            state.orchestrator.llm().backend_name()
        ),
    }
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelListResponse> {
    Json(ModelListResponse {
        models: vec![model_info(&state)],
    })
}

pub async fn get_model(State(state): State<AppState>, Path(model_id): Path<String>) -> Response {
    let info = model_info(&state);
    if model_id.trim_start_matches('/') == info.id {
        return Json(info).into_response();
    }
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "error": { "kind": "not_found", "message": "Model not found." }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_request_defaults() {
        let request: GenerationRequest = serde_json::from_str(r#"{"prompt": "hi"}"#).unwrap();
        assert_eq!(request.sampling, SamplingParams::default());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_generation_request_validation() {
        let blank: GenerationRequest = serde_json::from_str(r#"{"prompt": "  "}"#).unwrap();
        assert!(blank.validate().is_err());

        let too_long: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "hi", "max_tokens": 9000}"#).unwrap();
        assert!(matches!(
            too_long.validate(),
            Err(Error::InvalidInput { stage: None, .. })
        ));
    }

    #[test]
    fn test_ndjson_line() {
        let line = ndjson_line(&serde_json::json!({ "generated_text": "a" }));
        assert_eq!(&line[..], b"{\"generated_text\":\"a\"}\n");
    }
}
