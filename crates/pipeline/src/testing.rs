//! Scripted adapters for tests
//!
//! Each mock returns a fixed outcome and counts its calls so tests can assert
//! which stages ran.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use voice_gateway_core::{
    AudioMetadata, LanguageModel, RequestContext, SamplingParams, SpeechToText, StageError,
    SynthesisStream, SynthesizedAudio, TextToSpeech, TokenStream, Transcript,
    TranscriptionRequest, VoiceParams,
};

async fn pause(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

pub struct MockStt {
    outcome: Result<Transcript, StageError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockStt {
    pub fn ok(text: &str) -> Self {
        let mut transcript = Transcript::new(text);
        transcript.language = Some("en".to_string());
        Self::with_outcome(Ok(transcript))
    }

    pub fn failing(err: StageError) -> Self {
        Self::with_outcome(Err(err))
    }

    fn with_outcome(outcome: Result<Transcript, StageError>) -> Self {
        Self {
            outcome,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToText for MockStt {
    async fn transcribe(
        &self,
        _ctx: &RequestContext,
        _request: TranscriptionRequest,
    ) -> Result<Transcript, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        pause(self.delay).await;
        self.outcome.clone()
    }

    fn backend_name(&self) -> &str {
        "mock"
    }
}

pub struct MockLlm {
    outcome: Result<String, StageError>,
    calls: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
}

impl MockLlm {
    pub fn ok(text: &str) -> Self {
        Self::with_outcome(Ok(text.to_string()))
    }

    pub fn failing(err: StageError) -> Self {
        Self::with_outcome(Err(err))
    }

    fn with_outcome(outcome: Result<String, StageError>) -> Self {
        Self {
            outcome,
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().clone()
    }

    fn record(&self, prompt: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock() = Some(prompt.to_string());
    }
}

#[async_trait]
impl LanguageModel for MockLlm {
    async fn generate(
        &self,
        _ctx: &RequestContext,
        prompt: &str,
        _params: &SamplingParams,
    ) -> Result<String, StageError> {
        self.record(prompt);
        self.outcome.clone()
    }

    async fn generate_stream(
        &self,
        _ctx: &RequestContext,
        prompt: &str,
        _params: &SamplingParams,
    ) -> Result<TokenStream, StageError> {
        self.record(prompt);
        let text = self.outcome.clone()?;
        let fragments: Vec<Result<String, StageError>> = text
            .split_inclusive(' ')
            .map(|word| Ok(word.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(fragments)))
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    fn backend_name(&self) -> &str {
        "mock"
    }
}

pub struct MockTts {
    chunks: Result<Vec<Bytes>, StageError>,
    fail_after: Option<(usize, StageError)>,
    calls: AtomicUsize,
}

impl MockTts {
    pub fn ok(chunks: Vec<Bytes>) -> Self {
        Self {
            chunks: Ok(chunks),
            fail_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: StageError) -> Self {
        Self {
            chunks: Err(err),
            fail_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Streams `chunks[..n]` and then fails with `err`
    pub fn failing_after(chunks: Vec<Bytes>, n: usize, err: StageError) -> Self {
        Self {
            chunks: Ok(chunks),
            fail_after: Some((n, err)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextToSpeech for MockTts {
    async fn synthesize(
        &self,
        _ctx: &RequestContext,
        _text: &str,
        params: &VoiceParams,
    ) -> Result<SynthesizedAudio, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((_, err)) = &self.fail_after {
            return Err(err.clone());
        }
        let audio = self.chunks.clone()?.concat();
        Ok(SynthesizedAudio::new(audio, self.describe(params)))
    }

    async fn synthesize_stream(
        &self,
        _ctx: &RequestContext,
        _text: &str,
        params: &VoiceParams,
    ) -> Result<SynthesisStream, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let chunks = self.chunks.clone()?;
        let items: Vec<Result<Bytes, StageError>> = match &self.fail_after {
            Some((n, err)) => chunks
                .into_iter()
                .take(*n)
                .map(Ok)
                .chain(std::iter::once(Err(err.clone())))
                .collect(),
            None => chunks.into_iter().map(Ok).collect(),
        };
        Ok(SynthesisStream {
            metadata: self.describe(params),
            chunks: Box::pin(futures::stream::iter(items)),
        })
    }

    fn describe(&self, params: &VoiceParams) -> AudioMetadata {
        AudioMetadata::new(
            params.format.clone().unwrap_or_else(|| "wav".to_string()),
            params.sample_rate.unwrap_or(16_000),
            params.reference_id.clone(),
        )
    }

    fn backend_name(&self) -> &str {
        "mock"
    }
}
