//! Text-to-Speech backends
//!
//! - `OpenAudioTts`: OpenAudio `/v1/tts`
//! - `OpenAiSpeechTts`: OpenAI-compatible `/audio/speech` (Higgs Audio style)

mod openai_speech;
mod openaudio;

pub use openai_speech::OpenAiSpeechTts;
pub use openaudio::OpenAudioTts;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::StreamExt;
use reqwest::Response;
use serde::Deserialize;
use tokio::sync::OwnedSemaphorePermit;

use voice_gateway_core::{
    AudioMetadata, AudioStream, RequestContext, Stage, StageError, SynthesizedAudio,
};

use crate::upstream::transport_error;

/// JSON body some engines return instead of raw audio
#[derive(Debug, Deserialize)]
struct JsonAudioResponse {
    #[serde(default, alias = "audio_base64")]
    audio: Option<String>,
    #[serde(default, alias = "response_format")]
    format: Option<String>,
    #[serde(default)]
    sample_rate: Option<serde_json::Value>,
}

/// Decode a buffered synthesis response
///
/// JSON bodies carry base64 audio plus optional format and sample rate.
/// Anything else is raw audio with the sample rate in `x-sample-rate`.
pub(crate) async fn decode_audio_response(
    response: Response,
    requested: AudioMetadata,
) -> Result<SynthesizedAudio, StageError> {
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false);

    if is_json {
        let body: JsonAudioResponse = response
            .json()
            .await
            .map_err(|e| transport_error(Stage::Tts, e))?;
        let encoded = body
            .audio
            .filter(|a| !a.is_empty())
            .ok_or_else(|| StageError::internal(Stage::Tts, "Response missing audio payload"))?;
        let audio = BASE64.decode(encoded.as_bytes()).map_err(|e| {
            StageError::internal(Stage::Tts, format!("Invalid base64 audio payload: {}", e))
        })?;
        let format = body.format.unwrap_or(requested.response_format);
        let sample_rate = body
            .sample_rate
            .as_ref()
            .and_then(parse_sample_rate_value)
            .unwrap_or(requested.sample_rate);
        return Ok(SynthesizedAudio::new(
            audio,
            AudioMetadata::new(format, sample_rate, requested.reference_id),
        ));
    }

    let sample_rate = response
        .headers()
        .get("x-sample-rate")
        .and_then(|v| v.to_str().ok())
        .map(|raw| match raw.trim().parse::<u32>() {
            Ok(rate) => rate,
            Err(_) => {
                tracing::warn!(
                    header = raw,
                    "Falling back to requested sample rate due to malformed header"
                );
                requested.sample_rate
            }
        })
        .unwrap_or(requested.sample_rate);
    let audio = response
        .bytes()
        .await
        .map_err(|e| transport_error(Stage::Tts, e))?;
    Ok(SynthesizedAudio::new(
        audio,
        AudioMetadata::new(
            requested.response_format,
            sample_rate,
            requested.reference_id,
        ),
    ))
}

fn parse_sample_rate_value(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Turn a streaming response body into ordered, non-empty audio chunks
///
/// Reads are bounded by `ctx`; the permit is released when the stream is dropped.
pub(crate) fn chunk_stream(
    ctx: RequestContext,
    response: Response,
    permit: OwnedSemaphorePermit,
) -> AudioStream {
    let stream = async_stream::stream! {
        let _permit = permit;
        let mut body = response.bytes_stream();
        loop {
            match ctx.bound(Stage::Tts, async { Ok(body.next().await) }).await {
                Err(e) => {
                    yield Err(e);
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    yield Err(transport_error(Stage::Tts, e));
                    break;
                }
                Ok(Some(Ok(chunk))) => {
                    if !chunk.is_empty() {
                        yield Ok(chunk);
                    }
                }
            }
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sample_rate_value() {
        assert_eq!(parse_sample_rate_value(&serde_json::json!(24000)), Some(24000));
        assert_eq!(parse_sample_rate_value(&serde_json::json!("44100")), Some(44100));
        assert_eq!(parse_sample_rate_value(&serde_json::json!("fast")), None);
    }

    #[test]
    fn test_json_audio_aliases() {
        let body: JsonAudioResponse = serde_json::from_str(
            r#"{"audio_base64": "AAE=", "response_format": "mp3", "sample_rate": 22050}"#,
        )
        .unwrap();
        assert_eq!(body.audio.as_deref(), Some("AAE="));
        assert_eq!(body.format.as_deref(), Some("mp3"));
    }
}
