//! Stream Multiplexer
//!
//! Turns orchestrator progress into the wire event protocol. Every event is a
//! self-contained JSON object, written as one NDJSON line or one WebSocket
//! text frame.
//!
//! Order: `metadata` -> `transcript` -> `assistant_text` -> `audio_chunk`* -> `done`.
//! A fatal STT/LLM error ends the stream without `done`; a TTS error is
//! followed by `done`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;

use voice_gateway_core::{
    AudioMetadata, Error, RequestContext, Stage, StageError, StageResult, Transcript,
};

/// Error details carried by an `error` event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub message: String,
}

impl From<&StageError> for ErrorPayload {
    fn from(err: &StageError) -> Self {
        Self {
            kind: err.kind.as_str().to_string(),
            stage: Some(err.stage),
            message: err.message.clone(),
        }
    }
}

impl From<&Error> for ErrorPayload {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind().to_string(),
            stage: err.stage(),
            message: err.to_string(),
        }
    }
}

/// Buffered synthesis returned over the TTS WebSocket
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisPayload {
    pub audio_base64: String,
    #[serde(flatten)]
    pub metadata: AudioMetadata,
}

/// One event of the dialogue and speech protocols
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Metadata(AudioMetadata),
    Transcript(Transcript),
    AssistantText { text: String },
    AudioChunk { audio_base64: String, sequence: u64 },
    Synthesis(SynthesisPayload),
    Error(ErrorPayload),
    Done,
}

impl StreamEvent {
    pub fn audio_chunk(bytes: &[u8], sequence: u64) -> Self {
        StreamEvent::AudioChunk {
            audio_base64: BASE64.encode(bytes),
            sequence,
        }
    }

    pub fn error(payload: impl Into<ErrorPayload>) -> Self {
        StreamEvent::Error(payload.into())
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Metadata(_) => "metadata",
            StreamEvent::Transcript(_) => "transcript",
            StreamEvent::AssistantText { .. } => "assistant_text",
            StreamEvent::AudioChunk { .. } => "audio_chunk",
            StreamEvent::Synthesis(_) => "synthesis",
            StreamEvent::Error(_) => "error",
            StreamEvent::Done => "done",
        }
    }

    /// Encode as a single JSON text
    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(event = self.name(), "Failed to encode stream event: {}", e);
                r#"{"event":"error","data":{"kind":"internal_error","message":"event encoding failed"}}"#
                    .to_string()
            }
        }
    }

    /// Encode as one NDJSON line
    pub fn to_ndjson(&self) -> Bytes {
        let mut line = self.to_json();
        line.push('\n');
        Bytes::from(line)
    }
}

impl From<StageResult> for StreamEvent {
    fn from(result: StageResult) -> Self {
        match result {
            StageResult::Transcript(t) => StreamEvent::Transcript(t),
            StageResult::AssistantText(text) => StreamEvent::AssistantText { text },
            StageResult::AudioChunk { bytes, sequence } => StreamEvent::audio_chunk(&bytes, sequence),
            StageResult::StageError(e) => StreamEvent::error(&e),
        }
    }
}

/// Wrap an orchestrator run into the ordered event stream
///
/// Dropping the returned stream cancels `ctx`, which aborts the run.
pub fn dialogue_events(
    ctx: RequestContext,
    metadata: AudioMetadata,
    mut results: mpsc::Receiver<StageResult>,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    let guard = ctx.drop_guard();
    async_stream::stream! {
        let _guard = guard;
        yield StreamEvent::Metadata(metadata);

        let mut fatal = false;
        while let Some(result) = results.recv().await {
            if let StageResult::StageError(e) = &result {
                fatal = e.stage != Stage::Tts;
            }
            yield StreamEvent::from(result);
            if fatal {
                break;
            }
        }

        if !fatal && !ctx.is_cancelled() {
            yield StreamEvent::Done;
        }
    }
}

/// Encode events as NDJSON body chunks
pub fn ndjson_body(
    events: impl Stream<Item = StreamEvent> + Send + 'static,
) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>> + Send + 'static {
    events.map(|event| Ok(event.to_ndjson()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx() -> RequestContext {
        RequestContext::new("m", Duration::from_secs(5))
    }

    fn meta() -> AudioMetadata {
        AudioMetadata::new("pcm", 16_000, None)
    }

    async fn collect(results: Vec<StageResult>) -> Vec<StreamEvent> {
        let (tx, rx) = mpsc::channel(16);
        for r in results {
            tx.send(r).await.unwrap();
        }
        drop(tx);
        dialogue_events(ctx(), meta(), rx).collect().await
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::name).collect()
    }

    #[tokio::test]
    async fn test_successful_run_ends_with_done() {
        let events = collect(vec![
            StageResult::Transcript(Transcript::new("hi")),
            StageResult::AssistantText("hello".into()),
            StageResult::AudioChunk { bytes: Bytes::from_static(b"a"), sequence: 0 },
            StageResult::AudioChunk { bytes: Bytes::from_static(b"b"), sequence: 1 },
        ])
        .await;
        assert_eq!(
            names(&events),
            vec!["metadata", "transcript", "assistant_text", "audio_chunk", "audio_chunk", "done"]
        );
    }

    #[tokio::test]
    async fn test_stt_error_omits_done() {
        let events = collect(vec![StageResult::StageError(StageError::unavailable(
            Stage::Stt,
            "down",
        ))])
        .await;
        assert_eq!(names(&events), vec!["metadata", "error"]);
    }

    #[tokio::test]
    async fn test_tts_error_is_followed_by_done() {
        let events = collect(vec![
            StageResult::Transcript(Transcript::new("hi")),
            StageResult::AssistantText("hello".into()),
            StageResult::StageError(StageError::timeout(Stage::Tts)),
        ])
        .await;
        assert_eq!(
            names(&events),
            vec!["metadata", "transcript", "assistant_text", "error", "done"]
        );
    }

    #[test]
    fn test_wire_shapes() {
        let done: serde_json::Value = serde_json::from_str(&StreamEvent::Done.to_json()).unwrap();
        assert_eq!(done, serde_json::json!({"event": "done"}));

        let chunk: serde_json::Value =
            serde_json::from_str(&StreamEvent::audio_chunk(&[0, 1], 3).to_json()).unwrap();
        assert_eq!(chunk["event"], "audio_chunk");
        assert_eq!(chunk["data"]["audio_base64"], "AAE=");
        assert_eq!(chunk["data"]["sequence"], 3);

        let err = StreamEvent::error(&StageError::timeout(Stage::Tts));
        let err: serde_json::Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(err["data"]["stage"], "tts");
        assert_eq!(err["data"]["kind"], "timeout");
    }

    #[test]
    fn test_ndjson_line_is_newline_terminated() {
        let line = StreamEvent::Metadata(meta()).to_ndjson();
        assert!(line.ends_with(b"\n"));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_context() {
        let ctx = ctx();
        let (_tx, rx) = mpsc::channel(1);
        let mut events = Box::pin(dialogue_events(ctx.clone(), meta(), rx));
        assert!(matches!(events.next().await, Some(StreamEvent::Metadata(_))));
        drop(events);
        assert!(ctx.is_cancelled());
    }
}
