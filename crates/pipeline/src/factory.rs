//! Creates the configured speech backends

use std::sync::Arc;

use voice_gateway_config::{SttConfig, SttProvider, TtsConfig, TtsProvider};
use voice_gateway_core::{SpeechToText, TextToSpeech};

use crate::stt::{OpenAiWhisperStt, SidecarWhisperStt};
use crate::tts::{OpenAiSpeechTts, OpenAudioTts};
use crate::PipelineError;

pub fn create_stt(config: &SttConfig) -> Result<Arc<dyn SpeechToText>, PipelineError> {
    tracing::info!(
        provider = ?config.provider,
        endpoint = %config.client.endpoint,
        model = %config.model,
        "Creating STT backend"
    );
    let stt: Arc<dyn SpeechToText> = match config.provider {
        SttProvider::OpenAi => Arc::new(OpenAiWhisperStt::new(config)?),
        SttProvider::Sidecar => Arc::new(SidecarWhisperStt::new(config)?),
    };
    Ok(stt)
}

pub fn create_tts(config: &TtsConfig) -> Result<Arc<dyn TextToSpeech>, PipelineError> {
    tracing::info!(
        provider = ?config.provider,
        endpoint = %config.client.endpoint,
        "Creating TTS backend"
    );
    let tts: Arc<dyn TextToSpeech> = match config.provider {
        TtsProvider::OpenAudio => Arc::new(OpenAudioTts::new(config)?),
        TtsProvider::OpenAiSpeech => Arc::new(OpenAiSpeechTts::new(config)?),
    };
    Ok(tts)
}
