//! Creates the configured LLM backend

use std::sync::Arc;
use voice_gateway_config::{LlmConfig, LlmProvider};
use voice_gateway_core::LanguageModel;

use crate::{
    backend::{LlmBackendConfig, OllamaBackend, OpenAiCompletionsBackend},
    LlmError,
};

/// Build the language model selected by `settings.provider`
pub fn create_language_model(settings: &LlmConfig) -> Result<Arc<dyn LanguageModel>, LlmError> {
    let config = LlmBackendConfig::from_settings(settings);
    tracing::info!(
        provider = ?settings.provider,
        endpoint = %config.endpoint,
        model = %config.model,
        "Creating LLM backend"
    );
    let model: Arc<dyn LanguageModel> = match settings.provider {
        LlmProvider::Ollama => Arc::new(OllamaBackend::new(config)?),
        LlmProvider::OpenAiCompletions => Arc::new(OpenAiCompletionsBackend::new(config)?),
    };
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_selects_provider() {
        let mut settings = LlmConfig::default();
        let model = create_language_model(&settings).unwrap();
        assert_eq!(model.backend_name(), "ollama");
        assert_eq!(model.model_name(), "google/gemma-3-12b-it-qat-q4_0-gguf");

        settings.provider = LlmProvider::OpenAiCompletions;
        let model = create_language_model(&settings).unwrap();
        assert_eq!(model.backend_name(), "openai_completions");
    }
}
