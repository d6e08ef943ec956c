//! LLM backend implementations
//!
//! Both backends speak HTTP to an external engine and implement
//! `voice_gateway_core::LanguageModel` directly.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use voice_gateway_core::{
    LanguageModel, RequestContext, RetryPolicy, SamplingParams, Stage, StageError, TokenStream,
};

use crate::LlmError;

/// Connection settings for an LLM engine
#[derive(Debug, Clone)]
pub struct LlmBackendConfig {
    /// Base URL, e.g. `http://localhost:11434` for Ollama
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Model requested from the engine
    pub model: String,
    /// Model id reported to clients
    pub model_id: String,
    /// Per-attempt HTTP timeout
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub max_concurrent: usize,
}

impl Default for LlmBackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            api_key: None,
            model: "gemma3:12b-it-qat".to_string(),
            model_id: "google/gemma-3-12b-it-qat-q4_0-gguf".to_string(),
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            max_concurrent: 8,
        }
    }
}

impl LlmBackendConfig {
    pub fn from_settings(settings: &voice_gateway_config::LlmConfig) -> Self {
        let client = &settings.client;
        Self {
            endpoint: client.endpoint.trim_end_matches('/').to_string(),
            api_key: client.api_key.clone(),
            model: settings.model.clone(),
            model_id: settings.model_id.clone(),
            timeout: Duration::from_secs(client.timeout_secs),
            retry: RetryPolicy::new(
                client.max_retries,
                Duration::from_millis(client.initial_backoff_ms),
            ),
            max_concurrent: client.max_concurrent.max(1),
        }
    }
}

/// HTTP plumbing shared by the backends
#[derive(Clone)]
struct HttpEngine {
    client: Client,
    config: LlmBackendConfig,
    limiter: Arc<Semaphore>,
}

impl HttpEngine {
    fn new(config: LlmBackendConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        let limiter = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Response, LlmError> {
        let mut request = self.client.post(self.url(path)).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        check_status(request.send().await?).await
    }
}

/// Map an HTTP status to the error taxonomy
///
/// 5xx and 429 are retryable, other 4xx are not.
async fn check_status(response: Response) -> Result<Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() || status.as_u16() == 429 {
        return Err(LlmError::Network(format!("Server error {}: {}", status, body)));
    }
    Err(LlmError::Api {
        status: status.as_u16(),
        message: body,
    })
}

/// Splits a byte stream into complete text lines
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    /// Trailing data without a newline
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Read `response` line by line, turning each line into zero or more fragments
///
/// `parse` returns `Ok(None)` to end the stream early.
fn line_stream<F>(
    ctx: RequestContext,
    response: Response,
    permit: tokio::sync::OwnedSemaphorePermit,
    mut parse: F,
) -> TokenStream
where
    F: FnMut(&str) -> Result<Option<String>, LlmError> + Send + 'static,
{
    let stream = async_stream::stream! {
        let _permit = permit;
        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::default();
        'read: loop {
            let next = ctx.bound(Stage::Llm, async { Ok(body.next().await) }).await;
            let chunk = match next {
                Err(e) => {
                    yield Err(e);
                    break 'read;
                }
                Ok(None) => {
                    if let Some(line) = lines.finish() {
                        match parse(&line) {
                            Ok(Some(fragment)) if !fragment.is_empty() => {
                                yield Ok(fragment);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                yield Err(StageError::from(e));
                            }
                        }
                    }
                    break 'read;
                }
                Ok(Some(Err(e))) => {
                    yield Err(StageError::from(LlmError::from(e)));
                    break 'read;
                }
                Ok(Some(Ok(bytes))) => bytes,
            };
            for line in lines.push(&chunk) {
                match parse(&line) {
                    Ok(Some(fragment)) => {
                        if !fragment.is_empty() {
                            yield Ok(fragment);
                        }
                    }
                    Ok(None) => break 'read,
                    Err(e) => {
                        yield Err(StageError::from(e));
                        break 'read;
                    }
                }
            }
        }
    };
    Box::pin(stream)
}

// =============================================================================
// Ollama
// =============================================================================

/// Ollama backend using `/api/generate`
#[derive(Clone)]
pub struct OllamaBackend {
    engine: HttpEngine,
}

impl OllamaBackend {
    pub fn new(config: LlmBackendConfig) -> Result<Self, LlmError> {
        Ok(Self {
            engine: HttpEngine::new(config)?,
        })
    }

    async fn execute(&self, request: &OllamaGenerateRequest) -> Result<Response, StageError> {
        self.engine
            .post("/api/generate", request)
            .await
            .map_err(StageError::from)
    }
}

#[async_trait]
impl LanguageModel for OllamaBackend {
    async fn generate(
        &self,
        ctx: &RequestContext,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<String, StageError> {
        let request = OllamaGenerateRequest::new(&self.engine.config.model, prompt, params, false);
        ctx.bound(Stage::Llm, async {
            let _permit = ctx.acquire(Stage::Llm, &self.engine.limiter).await?;
            let this = self;
            let req = &request;
            let response: OllamaGenerateResponse = self
                .engine
                .config
                .retry
                .run(ctx, Stage::Llm, move || async move {
                    let response = this.execute(req).await?;
                    response
                        .json::<OllamaGenerateResponse>()
                        .await
                        .map_err(|e| StageError::from(LlmError::from(e)))
                })
                .await?;
            if let Some(error) = response.error {
                return Err(StageError::from(LlmError::InvalidResponse(error)));
            }
            Ok(response.response)
        })
        .await
    }

    async fn generate_stream(
        &self,
        ctx: &RequestContext,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<TokenStream, StageError> {
        let request = OllamaGenerateRequest::new(&self.engine.config.model, prompt, params, true);
        let permit = ctx.acquire(Stage::Llm, &self.engine.limiter).await?;
        let this = self;
        let req = &request;
        let response = ctx
            .bound(
                Stage::Llm,
                self.engine
                    .config
                    .retry
                    .run(ctx, Stage::Llm, move || async move { this.execute(req).await }),
            )
            .await?;

        Ok(line_stream(ctx.clone(), response, permit, parse_ollama_line))
    }

    fn model_name(&self) -> &str {
        &self.engine.config.model_id
    }

    fn backend_name(&self) -> &str {
        "ollama"
    }
}

fn parse_ollama_line(line: &str) -> Result<Option<String>, LlmError> {
    let chunk: OllamaGenerateResponse = serde_json::from_str(line)
        .map_err(|e| LlmError::InvalidResponse(format!("Malformed stream line: {}", e)))?;
    if let Some(error) = chunk.error {
        return Err(LlmError::InvalidResponse(error));
    }
    if chunk.done && chunk.response.is_empty() {
        return Ok(None);
    }
    Ok(Some(chunk.response))
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    repeat_penalty: f32,
    min_p: f32,
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

impl OllamaGenerateRequest {
    fn new(model: &str, prompt: &str, params: &SamplingParams, stream: bool) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.to_string(),
            stream,
            options: OllamaOptions {
                num_predict: params.max_tokens,
                temperature: params.temperature,
                top_p: params.top_p,
                top_k: params.top_k,
                repeat_penalty: params.repeat_penalty,
                min_p: params.min_p,
                stop: params.stop.clone(),
                seed: params.seed,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

// =============================================================================
// OpenAI-compatible completions (llama.cpp server)
// =============================================================================

/// Backend for engines exposing `/completions`
///
/// The endpoint includes the API version prefix, e.g. `http://localhost:8000/v1`.
#[derive(Clone)]
pub struct OpenAiCompletionsBackend {
    engine: HttpEngine,
}

impl OpenAiCompletionsBackend {
    pub fn new(config: LlmBackendConfig) -> Result<Self, LlmError> {
        Ok(Self {
            engine: HttpEngine::new(config)?,
        })
    }

    async fn execute(&self, request: &CompletionRequest) -> Result<Response, StageError> {
        self.engine
            .post("/completions", request)
            .await
            .map_err(StageError::from)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompletionsBackend {
    async fn generate(
        &self,
        ctx: &RequestContext,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<String, StageError> {
        let request = CompletionRequest::new(&self.engine.config.model, prompt, params, false);
        ctx.bound(Stage::Llm, async {
            let _permit = ctx.acquire(Stage::Llm, &self.engine.limiter).await?;
            let this = self;
            let req = &request;
            let response: CompletionResponse = self
                .engine
                .config
                .retry
                .run(ctx, Stage::Llm, move || async move {
                    let response = this.execute(req).await?;
                    response
                        .json::<CompletionResponse>()
                        .await
                        .map_err(|e| StageError::from(LlmError::from(e)))
                })
                .await?;
            response
                .choices
                .into_iter()
                .next()
                .map(|c| c.text)
                .ok_or_else(|| {
                    StageError::from(LlmError::InvalidResponse(
                        "Completion response has no choices".to_string(),
                    ))
                })
        })
        .await
    }

    async fn generate_stream(
        &self,
        ctx: &RequestContext,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<TokenStream, StageError> {
        let request = CompletionRequest::new(&self.engine.config.model, prompt, params, true);
        let permit = ctx.acquire(Stage::Llm, &self.engine.limiter).await?;
        let this = self;
        let req = &request;
        let response = ctx
            .bound(
                Stage::Llm,
                self.engine
                    .config
                    .retry
                    .run(ctx, Stage::Llm, move || async move { this.execute(req).await }),
            )
            .await?;

        Ok(line_stream(ctx.clone(), response, permit, parse_sse_line))
    }

    fn model_name(&self) -> &str {
        &self.engine.config.model_id
    }

    fn backend_name(&self) -> &str {
        "openai_completions"
    }
}

/// Parse one server-sent event line of a streamed completion
fn parse_sse_line(line: &str) -> Result<Option<String>, LlmError> {
    let Some(data) = line.strip_prefix("data:") else {
        // comments, event names and keep-alives
        return Ok(Some(String::new()));
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(None);
    }
    let chunk: CompletionResponse = serde_json::from_str(data)
        .map_err(|e| LlmError::InvalidResponse(format!("Malformed stream event: {}", e)))?;
    Ok(Some(
        chunk
            .choices
            .into_iter()
            .next()
            .map(|c| c.text)
            .unwrap_or_default(),
    ))
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    prompt: String,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    repeat_penalty: f32,
    min_p: f32,
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    stream: bool,
}

impl CompletionRequest {
    fn new(model: &str, prompt: &str, params: &SamplingParams, stream: bool) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.to_string(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            repeat_penalty: params.repeat_penalty,
            min_p: params.min_p,
            stop: params.stop.clone(),
            seed: params.seed,
            stream,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};
    use voice_gateway_core::StageErrorKind;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(endpoint: String) -> LlmBackendConfig {
        LlmBackendConfig {
            endpoint,
            retry: RetryPolicy::new(1, Duration::from_millis(1)),
            ..Default::default()
        }
    }

    #[test]
    fn test_line_buffer_splits_across_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"{\"response\":\"he").is_empty());
        let lines = buf.push(b"llo\"}\n{\"response\":\"!\"}\n{\"done\"");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "{\"response\":\"hello\"}");
        assert_eq!(buf.finish().as_deref(), Some("{\"done\""));
    }

    #[test]
    fn test_parse_sse_lines() {
        let line = r#"data: {"choices":[{"text":"Hi","index":0}]}"#;
        assert_eq!(parse_sse_line(line).unwrap().as_deref(), Some("Hi"));
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), None);
        assert_eq!(parse_sse_line(": ping").unwrap().as_deref(), Some(""));
        assert!(parse_sse_line("data: {oops").is_err());
    }

    #[test]
    fn test_ollama_options_carry_sampling() {
        let params = SamplingParams {
            seed: Some(7),
            ..Default::default()
        };
        let request = OllamaGenerateRequest::new("gemma", "User: hi\nAssistant:", &params, true);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["options"]["num_predict"], 512);
        assert_eq!(json["options"]["seed"], 7);
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn test_error_mapping() {
        let err: StageError = LlmError::Api {
            status: 400,
            message: "bad prompt".into(),
        }
        .into();
        assert_eq!(err.kind, StageErrorKind::InvalidInput);
        assert_eq!(err.stage, Stage::Llm);

        let err: StageError = LlmError::Network("refused".into()).into();
        assert_eq!(err.kind, StageErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_ollama_generate_and_stream() {
        let router = Router::new().route(
            "/api/generate",
            post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                if body["stream"] == true {
                    "{\"response\":\"Hel\",\"done\":false}\n{\"response\":\"lo\",\"done\":false}\n{\"response\":\"\",\"done\":true}\n"
                        .to_string()
                } else {
                    "{\"response\":\"Hello\",\"done\":true}".to_string()
                }
            }),
        );
        let backend = OllamaBackend::new(config(serve(router).await)).unwrap();
        let ctx = RequestContext::new("t", Duration::from_secs(5));
        let params = SamplingParams::default();

        let text = backend.generate(&ctx, "User: hi\nAssistant:", &params).await.unwrap();
        assert_eq!(text, "Hello");

        let stream = backend
            .generate_stream(&ctx, "User: hi\nAssistant:", &params)
            .await
            .unwrap();
        let fragments: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(fragments, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/completions",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    (axum::http::StatusCode::BAD_REQUEST, "prompt too long")
                }
            }),
        );
        let backend = OpenAiCompletionsBackend::new(config(serve(router).await)).unwrap();
        let ctx = RequestContext::new("t", Duration::from_secs(5));
        let err = backend
            .generate(&ctx, "x", &SamplingParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::InvalidInput);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/completions",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    (axum::http::StatusCode::SERVICE_UNAVAILABLE, "loading model")
                }
            }),
        );
        let backend = OpenAiCompletionsBackend::new(config(serve(router).await)).unwrap();
        let ctx = RequestContext::new("t", Duration::from_secs(5));
        let err = backend
            .generate(&ctx, "x", &SamplingParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Unavailable);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
