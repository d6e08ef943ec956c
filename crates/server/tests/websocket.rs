//! Socket endpoints exercised over a real listener

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use voice_gateway_config::Settings;
use voice_gateway_core::{Stage, StageError};
use voice_gateway_pipeline::testing::{MockLlm, MockStt, MockTts};
use voice_gateway_server::{create_router, AppState};

const API_KEY: &str = "test-key";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Gateway {
    addr: SocketAddr,
    stt: Arc<MockStt>,
    llm: Arc<MockLlm>,
    tts: Arc<MockTts>,
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.auth.enabled = true;
    settings.auth.api_keys = vec![API_KEY.to_string()];
    settings
}

async fn serve(settings: Settings, stt: MockStt, llm: MockLlm, tts: MockTts) -> Gateway {
    let stt = Arc::new(stt);
    let llm = Arc::new(llm);
    let tts = Arc::new(tts);
    let state = AppState::new(settings, stt.clone(), llm.clone(), tts.clone()).unwrap();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    Gateway { addr, stt, llm, tts }
}

async fn default_gateway() -> Gateway {
    serve(
        settings(),
        MockStt::ok("what time is it"),
        MockLlm::ok("It is noon."),
        MockTts::ok(vec![Bytes::from_static(b"RIFF"), Bytes::from_static(b"DATA")]),
    )
    .await
}

async fn connect(gateway: &Gateway, path: &str, key: Option<&str>) -> Result<Socket, WsError> {
    let mut request = format!("ws://{}{}", gateway.addr, path)
        .into_client_request()
        .unwrap();
    if let Some(key) = key {
        request.headers_mut().insert("x-api-key", key.parse().unwrap());
    }
    connect_async(request).await.map(|(socket, _)| socket)
}

fn rejected_status(result: Result<Socket, WsError>) -> u16 {
    match result {
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("unexpected handshake error: {}", other),
        Ok(_) => panic!("handshake should have been rejected"),
    }
}

async fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn next_message(socket: &mut Socket) -> Message {
    tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("socket ended")
        .unwrap()
}

async fn next_json(socket: &mut Socket) -> Value {
    match next_message(socket).await {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

/// Read events up to and including `done`
async fn events_until_done(socket: &mut Socket) -> Vec<Value> {
    let mut events = Vec::new();
    loop {
        let event = next_json(socket).await;
        let done = event["event"] == "done";
        events.push(event);
        if done {
            return events;
        }
    }
}

fn event_names(events: &[Value]) -> Vec<&str> {
    events.iter().map(|e| e["event"].as_str().unwrap()).collect()
}

#[tokio::test]
async fn test_handshake_rejected_before_upgrade() {
    let gateway = default_gateway().await;

    for path in ["/v1/speech-to-text/ws", "/v1/text-to-speech/ws", "/v1/generate_ws"] {
        assert_eq!(rejected_status(connect(&gateway, path, None).await), 401);
        assert_eq!(rejected_status(connect(&gateway, path, Some("wrong")).await), 403);
    }
    assert_eq!(gateway.stt.calls(), 0);
    assert_eq!(gateway.llm.calls(), 0);
    assert_eq!(gateway.tts.calls(), 0);
}

#[tokio::test]
async fn test_second_connection_over_limit_closes_with_4429() {
    let mut settings = settings();
    settings.rate_limit.enabled = true;
    settings.rate_limit.requests_per_window = 1;
    settings.rate_limit.window_seconds = 60.0;
    let gateway = serve(
        settings,
        MockStt::ok("hi"),
        MockLlm::ok("hello"),
        MockTts::ok(vec![Bytes::from_static(b"RIFF")]),
    )
    .await;

    let mut first = connect(&gateway, "/v1/text-to-speech/ws", Some(API_KEY)).await.unwrap();
    let mut second = connect(&gateway, "/v1/text-to-speech/ws", Some(API_KEY)).await.unwrap();

    let denial = next_json(&mut second).await;
    assert_eq!(denial["event"], "error");
    assert_eq!(denial["data"]["kind"], "rate_limited");
    match next_message(&mut second).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4429),
        other => panic!("expected close frame, got {:?}", other),
    }

    // The admitted socket keeps serving frames
    send(&mut first, json!({ "text": "hello" })).await;
    let events = events_until_done(&mut first).await;
    assert_eq!(event_names(&events), ["metadata", "audio_chunk", "done"]);
    assert_eq!(gateway.tts.calls(), 1);
}

#[tokio::test]
async fn test_tts_socket_streams_ordered_chunks() {
    let gateway = default_gateway().await;
    let mut socket = connect(&gateway, "/v1/text-to-speech/ws", Some(API_KEY)).await.unwrap();

    send(&mut socket, json!({ "text": "hello", "sample_rate": 22050 })).await;
    let events = events_until_done(&mut socket).await;

    assert_eq!(event_names(&events), ["metadata", "audio_chunk", "audio_chunk", "done"]);
    assert_eq!(events[0]["data"]["sample_rate"], 22050);
    assert_eq!(events[1]["data"]["sequence"], 0);
    assert_eq!(events[1]["data"]["audio_base64"], "UklGRg==");
    assert_eq!(events[2]["data"]["sequence"], 1);
}

#[tokio::test]
async fn test_tts_socket_buffered_frame() {
    let gateway = default_gateway().await;
    let mut socket = connect(&gateway, "/v1/text-to-speech/ws", Some(API_KEY)).await.unwrap();

    send(&mut socket, json!({ "input": "hello", "stream": false })).await;
    let event = next_json(&mut socket).await;
    assert_eq!(event["event"], "synthesis");
    assert_eq!(event["data"]["audio_base64"], "UklGRkRBVEE=");
}

#[tokio::test]
async fn test_tts_socket_mid_stream_failure_ends_with_done() {
    let gateway = serve(
        settings(),
        MockStt::ok("hi"),
        MockLlm::ok("hello"),
        MockTts::failing_after(
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
            1,
            StageError::timeout(Stage::Tts),
        ),
    )
    .await;
    let mut socket = connect(&gateway, "/v1/text-to-speech/ws", Some(API_KEY)).await.unwrap();

    send(&mut socket, json!({ "text": "hello" })).await;
    let events = events_until_done(&mut socket).await;
    assert_eq!(event_names(&events), ["metadata", "audio_chunk", "error", "done"]);
    assert_eq!(events[2]["data"]["stage"], "tts");
    assert_eq!(events[2]["data"]["kind"], "timeout");
}

#[tokio::test]
async fn test_tts_socket_silent_stream_is_an_error() {
    let gateway = serve(
        settings(),
        MockStt::ok("hi"),
        MockLlm::ok("hello"),
        MockTts::ok(vec![]),
    )
    .await;
    let mut socket = connect(&gateway, "/v1/text-to-speech/ws", Some(API_KEY)).await.unwrap();

    send(&mut socket, json!({ "text": "hello" })).await;
    let events = events_until_done(&mut socket).await;
    assert_eq!(event_names(&events), ["metadata", "error", "done"]);
    assert_eq!(events[1]["data"]["kind"], "internal");
}

#[tokio::test]
async fn test_stt_socket_survives_bad_frames() {
    let gateway = default_gateway().await;
    let mut socket = connect(&gateway, "/v1/speech-to-text/ws", Some(API_KEY)).await.unwrap();

    send(&mut socket, json!({ "language": "en" })).await;
    let error = next_json(&mut socket).await;
    assert_eq!(error["event"], "error");
    assert_eq!(error["data"]["kind"], "invalid_input");

    send(&mut socket, json!({ "audio_base64": "UklGRg==", "language": "en" })).await;
    let transcript = next_json(&mut socket).await;
    assert_eq!(transcript["event"], "transcript");
    assert_eq!(transcript["data"]["text"], "what time is it");
    assert_eq!(gateway.stt.calls(), 1);
}

#[tokio::test]
async fn test_generate_socket_streams_tokens() {
    let gateway = default_gateway().await;
    let mut socket = connect(&gateway, "/v1/generate_ws", Some(API_KEY)).await.unwrap();

    send(&mut socket, json!({ "prompt": "what time is it?" })).await;
    let mut text = String::new();
    loop {
        let frame = next_json(&mut socket).await;
        if frame["status"] == "done" {
            break;
        }
        text.push_str(frame["token"].as_str().unwrap());
    }
    assert_eq!(text, "It is noon.");
    assert_eq!(gateway.llm.last_prompt().as_deref(), Some("what time is it?"));
}
