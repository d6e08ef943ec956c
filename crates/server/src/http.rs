//! HTTP Endpoints
//!
//! Router assembly and the small endpoints that need no pipeline.

use axum::{
    extract::State,
    http::{HeaderName, HeaderValue, Method},
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::auth_middleware;
use crate::dialogue::dialogue;
use crate::generate::{generate, generate_stream, generate_ws, get_model, list_models};
use crate::metrics::metrics_handler;
use crate::rate_limit::rate_limit_middleware;
use crate::request_context::request_context_middleware;
use crate::speech::{speech_to_text, text_to_speech};
use crate::state::AppState;
use crate::websocket::{
    speech_to_text_ws, text_to_speech_ws, GENERATE_WS, SPEECH_TO_TEXT_WS, TEXT_TO_SPEECH_WS,
};

/// Create the application router
///
/// Layer order, outermost first: CORS, trace, request context, auth, rate
/// limit. Auth therefore always runs before rate limiting and before any
/// handler touches an upstream engine.
pub fn create_router(state: AppState) -> Router {
    let cors_layer = build_cors_layer(
        &state.config.server.cors_origins,
        state.config.server.cors_enabled,
        &state.request_id_header,
    );

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // Speech
        .route("/v1/speech-to-text", post(speech_to_text))
        .route("/v1/text-to-speech", post(text_to_speech))
        .route("/v1/dialogue", post(dialogue))
        .route(SPEECH_TO_TEXT_WS, get(speech_to_text_ws))
        .route(TEXT_TO_SPEECH_WS, get(text_to_speech_ws))
        // Generation
        .route("/v1/generate", post(generate))
        .route("/v1/generate_stream", post(generate_stream))
        .route(GENERATE_WS, get(generate_ws))
        .route("/v1/models", get(list_models))
        .route("/v1/models/*model_id", get(get_model))
        .layer(from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(from_fn_with_state(state.clone(), auth_middleware))
        .layer(from_fn_with_state(state.clone(), request_context_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

/// Build CORS layer from configured origins
///
/// - If cors_enabled is false, returns permissive layer (for dev)
/// - If no configured origin parses, defaults to localhost:3000
fn build_cors_layer(origins: &[String], enabled: bool, request_id_header: &HeaderName) -> CorsLayer {
    if !enabled {
        tracing::warn!("CORS is disabled - allowing all origins (NOT FOR PRODUCTION)");
        return CorsLayer::permissive();
    }

    let mut parsed_origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("Invalid CORS origin: {}", origin);
                None
            })
        })
        .collect();

    if parsed_origins.is_empty() {
        tracing::info!("No usable CORS origins configured, defaulting to localhost:3000");
        parsed_origins.push(HeaderValue::from_static("http://localhost:3000"));
    } else {
        tracing::info!("CORS configured with {} origins", parsed_origins.len());
    }

    CorsLayer::new()
        .allow_origin(parsed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([
            request_id_header.clone(),
            HeaderName::from_static("x-audio-format"),
            HeaderName::from_static("x-sample-rate"),
            HeaderName::from_static("x-reference-id"),
        ])
}

/// Liveness probe
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let orchestrator = &state.orchestrator;
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "backends": {
            "stt": orchestrator.stt().backend_name(),
            "llm": orchestrator.llm().backend_name(),
            "tts": orchestrator.tts().backend_name(),
        },
    }))
}
