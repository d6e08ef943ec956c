//! Language model trait

use crate::context::RequestContext;
use crate::error::StageError;
use crate::llm_types::SamplingParams;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Incremental text fragments from a streaming generation
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, StageError>> + Send>>;

/// Text generation interface
///
/// Implementations:
/// - `OllamaBackend` - Ollama `/api/generate`
/// - `OpenAiCompletionsBackend` - llama.cpp style `/v1/completions`
#[async_trait]
pub trait LanguageModel: Send + Sync + 'static {
    /// Generate a full completion for `prompt`
    async fn generate(
        &self,
        ctx: &RequestContext,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<String, StageError>;

    /// Stream completion fragments as they are produced
    async fn generate_stream(
        &self,
        ctx: &RequestContext,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<TokenStream, StageError>;

    /// Model identifier reported by `/v1/models`
    fn model_name(&self) -> &str;

    fn backend_name(&self) -> &str;
}
