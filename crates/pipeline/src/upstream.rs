//! HTTP plumbing shared by the speech backends

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use voice_gateway_config::UpstreamClientConfig;
use voice_gateway_core::{RetryPolicy, Stage, StageError};

use crate::PipelineError;

/// Client for one external engine with its retry policy and concurrency cap
#[derive(Clone)]
pub(crate) struct UpstreamClient {
    stage: Stage,
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    pub(crate) retry: RetryPolicy,
    pub(crate) limiter: Arc<Semaphore>,
}

impl UpstreamClient {
    pub(crate) fn new(stage: Stage, config: &UpstreamClientConfig) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                PipelineError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self {
            stage,
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.initial_backoff_ms),
            ),
            limiter: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
        })
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        let request = self.client.post(self.url(path));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Send `request` and classify transport and status failures
    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<Response, StageError> {
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(self.stage, e))?;
        check_status(self.stage, response).await
    }
}

/// Classify a reqwest failure
pub(crate) fn transport_error(stage: Stage, err: reqwest::Error) -> StageError {
    if err.is_timeout() {
        StageError::timeout(stage)
    } else if err.is_decode() {
        StageError::internal(stage, format!("Malformed response: {}", err))
    } else {
        StageError::unavailable(stage, err.to_string())
    }
}

/// Map an HTTP status to the error taxonomy
///
/// 5xx and 429 are `Unavailable` and retried; any other 4xx means the engine
/// refused the call and is `InvalidInput`.
pub(crate) async fn check_status(stage: Stage, response: Response) -> Result<Response, StageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", stage, status, truncate(&body, 256));
    Err(classify_status(stage, status, message))
}

fn classify_status(stage: Stage, status: StatusCode, message: String) -> StageError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StageError::unavailable(stage, message)
    } else {
        StageError::invalid_input(stage, message)
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_gateway_core::StageErrorKind;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[test]
    fn test_only_server_errors_and_throttling_are_retryable() {
        for code in [500u16, 502, 503, 504, 429] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = classify_status(Stage::Stt, status, String::new());
            assert!(err.is_retryable(), "{} should be retried", code);
        }
        for code in [400u16, 401, 403, 404, 413, 415, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = classify_status(Stage::Tts, status, String::new());
            assert_eq!(err.kind, StageErrorKind::InvalidInput, "status {}", code);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let client =
            UpstreamClient::new(Stage::Tts, &UpstreamClientConfig::new("http://tts:8080/")).unwrap();
        assert_eq!(client.url("/v1/tts"), "http://tts:8080/v1/tts");
    }
}
