//! Application State
//!
//! Shared state across all handlers.

use axum::http::HeaderName;
use std::sync::Arc;
use std::time::Duration;

use voice_gateway_config::Settings;
use voice_gateway_core::{LanguageModel, SpeechToText, TextToSpeech};
use voice_gateway_llm::create_language_model;
use voice_gateway_pipeline::{create_stt, create_tts, DialogueOrchestrator};

use crate::auth::Authenticator;
use crate::rate_limit::{BucketRegistry, RateLimiter};
use crate::ServerError;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub orchestrator: DialogueOrchestrator,
    pub authenticator: Arc<Authenticator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub request_id_header: HeaderName,
}

impl AppState {
    /// Build state around already constructed adapters
    pub fn new(
        config: Settings,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Result<Self, ServerError> {
        let request_id_header = HeaderName::try_from(config.server.request_id_header.trim())
            .map_err(|e| {
                ServerError::Configuration(format!(
                    "Invalid request id header '{}': {}",
                    config.server.request_id_header, e
                ))
            })?;
        let orchestrator = DialogueOrchestrator::new(stt, llm, tts, &config.orchestrator);
        let authenticator = Authenticator::new(&config.auth)?;
        let rate_limiter = RateLimiter::new(&config.rate_limit, Arc::new(BucketRegistry::new()));

        Ok(Self {
            config: Arc::new(config),
            orchestrator,
            authenticator: Arc::new(authenticator),
            rate_limiter: Arc::new(rate_limiter),
            request_id_header,
        })
    }

    /// Build state with the backends selected in `config`
    pub fn from_settings(config: Settings) -> Result<Self, ServerError> {
        let stt = create_stt(&config.stt)?;
        let llm = create_language_model(&config.llm)?;
        let tts = create_tts(&config.tts)?;
        tracing::info!(
            stt = stt.backend_name(),
            llm = llm.backend_name(),
            model = llm.model_name(),
            tts = tts.backend_name(),
            "Initialized capability adapters"
        );
        Self::new(config, stt, llm, tts)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.request_timeout_secs)
    }

    /// Paths served without authentication or rate limiting
    pub fn is_public_path(&self, path: &str) -> bool {
        self.config
            .auth
            .public_paths
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }
}
