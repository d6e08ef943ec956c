//! WebSocket Handlers
//!
//! Speech endpoints over a persistent socket. Each text frame carries one JSON
//! request with the same parameters as the REST call; replies are
//! [`StreamEvent`] frames.
//!
//! Authentication runs as middleware before the upgrade. Rate limiting skips
//! the socket routes in middleware and is checked once per connection by the
//! handler, so a denial can be reported with close code 4429.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Method,
    response::Response,
    Extension,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::{Duration, Instant};
use tokio_util::sync::DropGuard;

use voice_gateway_core::{
    Error, RequestContext, RequestIdentity, Stage, StageError, TranscriptionRequest, VoiceParams,
};
use voice_gateway_pipeline::{metrics::record_pipeline, StreamEvent, SynthesisPayload};

use crate::rate_limit::Admission;
use crate::state::AppState;

/// Close code sent when the connection is over its rate limit
pub const CLOSE_RATE_LIMITED: u16 = 4429;

/// Upper bound on a socket session; frames get their own request timeout
const SESSION_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

pub(crate) type WsSender = SplitSink<WebSocket, Message>;
pub(crate) type WsReceiver = SplitStream<WebSocket>;

pub const SPEECH_TO_TEXT_WS: &str = "/v1/speech-to-text/ws";
pub const TEXT_TO_SPEECH_WS: &str = "/v1/text-to-speech/ws";
pub const GENERATE_WS: &str = "/v1/generate_ws";

/// Routes whose handlers run their own admission check
const SOCKET_ROUTES: [&str; 3] = [SPEECH_TO_TEXT_WS, TEXT_TO_SPEECH_WS, GENERATE_WS];

/// Whether the request targets a socket route
///
/// Decided by method and path only; client headers such as `Upgrade` do not
/// exempt a REST route from rate limiting.
pub fn is_socket_route(method: &Method, path: &str) -> bool {
    method == Method::GET && SOCKET_ROUTES.contains(&path)
}

/// Admission decided before the upgrade completes
pub(crate) struct SocketAdmission(Admission);

impl SocketAdmission {
    /// Hand back the socket if admitted, else close it with 4429
    ///
    /// A denied socket is closed before any session context or pipeline work
    /// is allocated for it.
    pub async fn accept(self, mut socket: WebSocket) -> Option<WebSocket> {
        match self.0 {
            Admission::Allowed => Some(socket),
            Admission::Denied { retry_after_secs } => {
                let err = Error::RateLimited { retry_after_secs };
                let _ = socket
                    .send(Message::Text(StreamEvent::error(&err).to_json()))
                    .await;
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_RATE_LIMITED,
                        reason: Cow::from("Rate limit exceeded"),
                    })))
                    .await;
                None
            }
        }
    }
}

pub(crate) fn admit_socket(state: &AppState, identity: &RequestIdentity) -> SocketAdmission {
    SocketAdmission(state.rate_limiter.admit(identity))
}

/// Context spanning one socket; cancelled when the socket handler returns
pub(crate) struct SessionContext {
    ctx: RequestContext,
    _guard: DropGuard,
}

impl SessionContext {
    pub fn new() -> Self {
        let ctx = RequestContext::with_generated_id(SESSION_LIFETIME);
        let guard = ctx.drop_guard();
        tracing::debug!(session_id = ctx.id(), "WebSocket session opened");
        Self { ctx, _guard: guard }
    }

    /// Context for one request frame
    pub fn frame(&self, timeout: Duration) -> RequestContext {
        self.ctx.child(timeout)
    }
}

/// Next text frame, or `None` once the peer is gone
pub(crate) async fn next_text(receiver: &mut WsReceiver) -> Option<String> {
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => return Some(text),
                Err(_) => tracing::debug!("Ignoring non UTF-8 binary frame"),
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket receive failed");
                return None;
            }
        }
    }
    None
}

pub(crate) async fn send_json(sender: &mut WsSender, value: &impl Serialize) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).map_err(axum::Error::new)?;
    sender.send(Message::Text(text)).await
}

pub(crate) async fn send_event(sender: &mut WsSender, event: &StreamEvent) -> Result<(), axum::Error> {
    sender.send(Message::Text(event.to_json())).await
}

/// `GET /v1/speech-to-text/ws` frame
#[derive(Debug, Deserialize)]
pub struct TranscriptionFrame {
    #[serde(default)]
    pub audio_base64: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl TranscriptionFrame {
    pub fn into_request(self) -> Result<TranscriptionRequest, Error> {
        let encoded = self
            .audio_base64
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::invalid_input("Missing 'audio_base64' field."))?;
        let audio = BASE64
            .decode(encoded.as_bytes())
            .map_err(|_| Error::invalid_input("Invalid base64 data supplied for 'audio_base64'."))?;
        if audio.is_empty() {
            return Err(Error::invalid_input("Decoded audio was empty"));
        }
        Ok(TranscriptionRequest {
            audio: audio.into(),
            filename: self.filename.or_else(|| Some("audio.wav".to_string())),
            content_type: self.content_type,
            language: self.language,
            prompt: self.prompt,
            response_format: self.response_format,
            temperature: self.temperature,
        })
    }
}

/// `GET /v1/text-to-speech/ws` frame
#[derive(Debug, Deserialize)]
pub struct SynthesisFrame {
    #[serde(default, alias = "input")]
    pub text: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(flatten)]
    pub voice: VoiceParams,
}

fn default_stream() -> bool {
    true
}

fn parse_frame<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, Error> {
    serde_json::from_str(text).map_err(|e| Error::invalid_input(format!("Invalid frame: {}", e)))
}

pub async fn speech_to_text_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
) -> Response {
    let admitted = admit_socket(&state, &identity);
    ws.on_upgrade(move |socket| async move {
        if let Some(socket) = admitted.accept(socket).await {
            transcription_session(socket, state).await;
        }
    })
}

async fn transcription_session(socket: WebSocket, state: AppState) {
    let session = SessionContext::new();
    let (mut sender, mut receiver) = socket.split();

    while let Some(text) = next_text(&mut receiver).await {
        let ctx = session.frame(state.request_timeout());
        let request = match parse_frame::<TranscriptionFrame>(&text).and_then(TranscriptionFrame::into_request) {
            Ok(request) => request,
            Err(err) => {
                if send_event(&mut sender, &StreamEvent::error(&err)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let started = Instant::now();
        let result = state.orchestrator.transcribe(&ctx, request).await;
        record_pipeline("speech_to_text_ws", started.elapsed(), result.is_ok());
        let event = match result {
            Ok(transcript) => StreamEvent::Transcript(transcript),
            Err(e) => StreamEvent::error(&e),
        };
        if send_event(&mut sender, &event).await.is_err() {
            break;
        }
    }
    tracing::debug!("Speech-to-text WebSocket closed");
}

pub async fn text_to_speech_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
) -> Response {
    let admitted = admit_socket(&state, &identity);
    ws.on_upgrade(move |socket| async move {
        if let Some(socket) = admitted.accept(socket).await {
            synthesis_session(socket, state).await;
        }
    })
}

async fn synthesis_session(socket: WebSocket, state: AppState) {
    let session = SessionContext::new();
    let (mut sender, mut receiver) = socket.split();

    while let Some(text) = next_text(&mut receiver).await {
        let ctx = session.frame(state.request_timeout());
        let frame = match parse_frame::<SynthesisFrame>(&text) {
            Ok(frame) if !frame.text.trim().is_empty() => frame,
            Ok(_) => {
                let err = Error::invalid_input("Missing 'text' field.");
                if send_event(&mut sender, &StreamEvent::error(&err)).await.is_err() {
                    break;
                }
                continue;
            }
            Err(err) => {
                if send_event(&mut sender, &StreamEvent::error(&err)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let open = if frame.stream {
            stream_synthesis(&mut sender, &state, &ctx, &frame).await
        } else {
            buffered_synthesis(&mut sender, &state, &ctx, &frame).await
        };
        if !open {
            break;
        }
    }
    tracing::debug!("Text-to-speech WebSocket closed");
}

/// Returns whether the socket is still writable
async fn buffered_synthesis(
    sender: &mut WsSender,
    state: &AppState,
    ctx: &RequestContext,
    frame: &SynthesisFrame,
) -> bool {
    let started = Instant::now();
    let result = state
        .orchestrator
        .synthesize(ctx, &frame.text, &frame.voice)
        .await;
    record_pipeline("text_to_speech_ws", started.elapsed(), result.is_ok());
    let event = match result {
        Ok(audio) => StreamEvent::Synthesis(SynthesisPayload {
            audio_base64: BASE64.encode(&audio.audio),
            metadata: audio.metadata,
        }),
        Err(e) => StreamEvent::error(&e),
    };
    send_event(sender, &event).await.is_ok()
}

/// Sends `metadata`, the ordered chunks, then `done`
///
/// A failure before the first event is a lone `error`; a failure mid-stream
/// is an `error` followed by `done`.
async fn stream_synthesis(
    sender: &mut WsSender,
    state: &AppState,
    ctx: &RequestContext,
    frame: &SynthesisFrame,
) -> bool {
    let started = Instant::now();
    let stream = match state
        .orchestrator
        .synthesize_stream(ctx, &frame.text, &frame.voice)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            record_pipeline("text_to_speech_ws_stream", started.elapsed(), false);
            return send_event(sender, &StreamEvent::error(&e)).await.is_ok();
        }
    };

    if send_event(sender, &StreamEvent::Metadata(stream.metadata)).await.is_err() {
        return false;
    }

    let mut chunks = stream.chunks;
    let mut sequence = 0u64;
    let mut success = true;
    while let Some(chunk) = chunks.next().await {
        let event = match chunk {
            Ok(bytes) if bytes.is_empty() => continue,
            Ok(bytes) => {
                let event = StreamEvent::audio_chunk(&bytes, sequence);
                sequence += 1;
                event
            }
            Err(e) => {
                success = false;
                StreamEvent::error(&e)
            }
        };
        if send_event(sender, &event).await.is_err() {
            // Dropping `chunks` aborts the upstream call
            return false;
        }
        if !success {
            break;
        }
    }
    if success && sequence == 0 {
        success = false;
        let err = StageError::internal(Stage::Tts, "synthesis produced no audio");
        if send_event(sender, &StreamEvent::error(&err)).await.is_err() {
            return false;
        }
    }
    record_pipeline("text_to_speech_ws_stream", started.elapsed(), success);
    send_event(sender, &StreamEvent::Done).await.is_ok()
}
