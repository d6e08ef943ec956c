//! Request id, context and access logging
//!
//! Outermost gateway middleware: assigns the request id before auth so that
//! rejected requests are still correlated, attaches the [`RequestContext`],
//! echoes the id on the response and records HTTP metrics.

use axum::{
    extract::{MatchedPath, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::Instrument;

use voice_gateway_core::RequestContext;

use crate::error::ErrorTag;
use crate::metrics::record_http_request;
use crate::state::AppState;

/// Longest client-supplied request id we accept
const MAX_REQUEST_ID_LEN: usize = 128;

pub async fn request_context_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(&state.request_id_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let ctx = RequestContext::new(request_id.as_str(), state.request_timeout());
    request.extensions_mut().insert(ctx);

    let method = request.method().clone();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let span = tracing::info_span!(
        "http_request",
        method = %method,
        uri = %request.uri(),
        request_id = %request_id,
    );

    let started = Instant::now();
    let mut response = next.run(request).instrument(span).await;
    let elapsed = started.elapsed();
    let status = response.status();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(state.request_id_header.clone(), value);
    }

    record_http_request(method.as_str(), &path, status.as_u16(), elapsed);
    if let Some(tag) = response.extensions().get::<ErrorTag>() {
        tracing::warn!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = status.as_u16(),
            kind = tag.kind,
            stage = tag.stage.map(|s| s.as_str()),
            elapsed_ms = elapsed.as_millis() as u64,
            "Request failed"
        );
    } else {
        tracing::debug!(
            request_id = %request_id,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );
    }
    response
}
