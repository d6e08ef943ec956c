//! Dialogue Orchestrator
//!
//! Sequences STT -> LLM -> TTS for one request. Each stage runs under a child
//! context carrying its own timeout; cancelling the request context drops the
//! in-flight stage and no later stage starts.
//!
//! - STT or LLM failure aborts the dialogue
//! - TTS failure degrades to text-only

use futures::{Future, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use voice_gateway_config::OrchestratorConfig;
use voice_gateway_core::{
    AudioMetadata, DialogueOutcome, DialogueRequest, Error, LanguageModel, RequestContext,
    SamplingParams, SpeechToText, Stage, StageError, StageErrorKind, StageResult,
    SynthesisStream, SynthesizedAudio, TextToSpeech, TokenStream, Transcript,
    TranscriptionRequest, VoiceParams,
};
use voice_gateway_llm::build_dialogue_prompt;

use crate::metrics::{record_pipeline, record_stage};

/// Per-stage time limits
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub stt: Duration,
    pub llm: Duration,
    pub tts: Duration,
}

impl StageTimeouts {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            stt: Duration::from_secs(config.stt_timeout_secs),
            llm: Duration::from_secs(config.llm_timeout_secs),
            tts: Duration::from_secs(config.tts_timeout_secs),
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Chains the three capability adapters into one dialogue turn
#[derive(Clone)]
pub struct DialogueOrchestrator {
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    timeouts: StageTimeouts,
    channel_capacity: usize,
}

impl DialogueOrchestrator {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            stt,
            llm,
            tts,
            timeouts: StageTimeouts::from_config(config),
            channel_capacity: config.channel_capacity.max(1),
        }
    }

    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn stt(&self) -> &Arc<dyn SpeechToText> {
        &self.stt
    }

    pub fn llm(&self) -> &Arc<dyn LanguageModel> {
        &self.llm
    }

    pub fn tts(&self) -> &Arc<dyn TextToSpeech> {
        &self.tts
    }

    /// Format metadata the dialogue will announce before STT begins
    pub fn describe_audio(&self, voice: &VoiceParams) -> AudioMetadata {
        self.tts.describe(voice)
    }

    /// Run a dialogue, emitting stage results as they become available
    ///
    /// Results arrive on a bounded channel in causal order. The channel
    /// closes after the last result; a cancelled run closes it without
    /// emitting anything further.
    pub fn run(&self, ctx: RequestContext, request: DialogueRequest) -> mpsc::Receiver<StageResult> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let this = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let success = this.drive(&ctx, request, &tx).await;
            if !ctx.is_cancelled() {
                record_pipeline("dialogue_stream", started.elapsed(), success);
            }
        });
        rx
    }

    /// Returns whether the run finished without a stage error
    async fn drive(
        &self,
        ctx: &RequestContext,
        request: DialogueRequest,
        tx: &mpsc::Sender<StageResult>,
    ) -> bool {
        let DialogueRequest {
            audio,
            instructions,
            stream_audio,
            sampling,
            voice,
        } = request;

        let transcript = match self.transcribe(ctx, audio).await {
            Ok(t) => t,
            Err(e) => return emit_failure(ctx, tx, e).await,
        };
        let prompt = build_dialogue_prompt(&transcript.text, instructions.as_deref());
        if tx.send(StageResult::Transcript(transcript)).await.is_err() {
            return false;
        }

        let text = match self.generate(ctx, &prompt, &sampling).await {
            Ok(t) => t,
            Err(e) => return emit_failure(ctx, tx, e).await,
        };
        if tx.send(StageResult::AssistantText(text.clone())).await.is_err() {
            return false;
        }

        let tts_result = if stream_audio {
            self.stream_speech(ctx, &text, &voice, tx).await
        } else {
            match self.synthesize(ctx, &text, &voice).await {
                Ok(audio) => {
                    let chunk = StageResult::AudioChunk {
                        bytes: audio.audio,
                        sequence: 0,
                    };
                    let _ = tx.send(chunk).await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        match tts_result {
            Ok(()) => true,
            Err(e) => emit_failure(ctx, tx, e).await,
        }
    }

    /// Run a dialogue to completion and collect the outcome
    ///
    /// A TTS failure still yields an outcome with `audio_error` set.
    pub async fn run_buffered(
        &self,
        ctx: &RequestContext,
        request: DialogueRequest,
    ) -> Result<DialogueOutcome, Error> {
        let started = Instant::now();
        let result = self.collect(ctx, request).await;
        let success = matches!(&result, Ok(outcome) if !outcome.is_degraded());
        record_pipeline("dialogue", started.elapsed(), success);
        result
    }

    async fn collect(
        &self,
        ctx: &RequestContext,
        request: DialogueRequest,
    ) -> Result<DialogueOutcome, Error> {
        let metadata = self.describe_audio(&request.voice);
        let transcript = self.transcribe(ctx, request.audio).await?;
        let prompt = build_dialogue_prompt(&transcript.text, request.instructions.as_deref());
        let response_text = self.generate(ctx, &prompt, &request.sampling).await?;

        let (audio, audio_error, metadata) =
            match self.synthesize(ctx, &response_text, &request.voice).await {
                Ok(audio) => {
                    let metadata = audio.metadata.clone();
                    (Some(audio), None, metadata)
                }
                Err(e) if e.kind == StageErrorKind::Cancelled => return Err(Error::Cancelled),
                Err(e) => (None, Some(e), metadata),
            };

        Ok(DialogueOutcome {
            transcript,
            response_text,
            audio,
            audio_error,
            metadata,
        })
    }

    pub async fn transcribe(
        &self,
        ctx: &RequestContext,
        request: TranscriptionRequest,
    ) -> Result<Transcript, StageError> {
        let stage_ctx = ctx.child(self.timeouts.stt);
        self.timed(
            &stage_ctx,
            Stage::Stt,
            self.stt.backend_name(),
            self.stt.transcribe(&stage_ctx, request),
        )
        .await
    }

    pub async fn generate(
        &self,
        ctx: &RequestContext,
        prompt: &str,
        sampling: &SamplingParams,
    ) -> Result<String, StageError> {
        let stage_ctx = ctx.child(self.timeouts.llm);
        let text = self
            .timed(
                &stage_ctx,
                Stage::Llm,
                self.llm.backend_name(),
                self.llm.generate(&stage_ctx, prompt, sampling),
            )
            .await?;
        Ok(text.trim().to_string())
    }

    pub async fn synthesize(
        &self,
        ctx: &RequestContext,
        text: &str,
        voice: &VoiceParams,
    ) -> Result<SynthesizedAudio, StageError> {
        let stage_ctx = ctx.child(self.timeouts.tts);
        self.timed(
            &stage_ctx,
            Stage::Tts,
            self.tts.backend_name(),
            self.tts.synthesize(&stage_ctx, text, voice),
        )
        .await
    }

    /// Start a streaming generation bounded by the LLM timeout
    pub async fn generate_stream(
        &self,
        ctx: &RequestContext,
        prompt: &str,
        sampling: &SamplingParams,
    ) -> Result<TokenStream, StageError> {
        let stage_ctx = ctx.child(self.timeouts.llm);
        let tokens = self
            .timed(
                &stage_ctx,
                Stage::Llm,
                self.llm.backend_name(),
                self.llm.generate_stream(&stage_ctx, prompt, sampling),
            )
            .await?;
        Ok(bounded(stage_ctx, Stage::Llm, tokens))
    }

    /// Start a standalone streaming synthesis bounded by the TTS timeout
    pub async fn synthesize_stream(
        &self,
        ctx: &RequestContext,
        text: &str,
        voice: &VoiceParams,
    ) -> Result<SynthesisStream, StageError> {
        let stage_ctx = ctx.child(self.timeouts.tts);
        let stream = self
            .timed(
                &stage_ctx,
                Stage::Tts,
                self.tts.backend_name(),
                self.tts.synthesize_stream(&stage_ctx, text, voice),
            )
            .await?;
        Ok(SynthesisStream {
            metadata: stream.metadata,
            chunks: bounded(stage_ctx, Stage::Tts, stream.chunks),
        })
    }

    /// Stream synthesized chunks onto `tx` with sequence numbers from 0
    async fn stream_speech(
        &self,
        ctx: &RequestContext,
        text: &str,
        voice: &VoiceParams,
        tx: &mpsc::Sender<StageResult>,
    ) -> Result<(), StageError> {
        let stage_ctx = ctx.child(self.timeouts.tts);
        let backend = self.tts.backend_name();
        let started = Instant::now();

        let result = stage_ctx
            .bound(Stage::Tts, async {
                let mut stream = self.tts.synthesize_stream(&stage_ctx, text, voice).await?;
                let mut sequence = 0u64;
                while let Some(chunk) = stream.chunks.next().await {
                    let bytes = chunk?;
                    if bytes.is_empty() {
                        continue;
                    }
                    if tx
                        .send(StageResult::AudioChunk { bytes, sequence })
                        .await
                        .is_err()
                    {
                        return Err(StageError::cancelled(Stage::Tts));
                    }
                    sequence += 1;
                }
                if sequence == 0 {
                    return Err(StageError::internal(Stage::Tts, "synthesis produced no audio"));
                }
                Ok(())
            })
            .await;

        record_stage(Stage::Tts, backend, started.elapsed(), result.as_ref().err());
        if let Err(e) = &result {
            log_stage_failure(&stage_ctx, e, started.elapsed());
        }
        result
    }

    async fn timed<T, F>(
        &self,
        stage_ctx: &RequestContext,
        stage: Stage,
        backend: &str,
        fut: F,
    ) -> Result<T, StageError>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        let started = Instant::now();
        let result = stage_ctx.bound(stage, fut).await;
        let elapsed = started.elapsed();
        record_stage(stage, backend, elapsed, result.as_ref().err());
        match &result {
            Ok(_) => tracing::debug!(
                request_id = %stage_ctx.id(),
                stage = %stage,
                backend,
                elapsed_ms = elapsed.as_millis() as u64,
                "Stage completed"
            ),
            Err(e) => log_stage_failure(stage_ctx, e, elapsed),
        }
        result
    }
}

/// Bound every read of `inner` by `ctx`, ending after the first error
fn bounded<T: Send + 'static>(
    ctx: RequestContext,
    stage: Stage,
    mut inner: Pin<Box<dyn Stream<Item = Result<T, StageError>> + Send>>,
) -> Pin<Box<dyn Stream<Item = Result<T, StageError>> + Send>> {
    Box::pin(async_stream::stream! {
        loop {
            match ctx.bound(stage, async { Ok(inner.next().await) }).await {
                Ok(Some(Ok(item))) => yield Ok(item),
                Ok(Some(Err(e))) | Err(e) => {
                    yield Err(e);
                    break;
                }
                Ok(None) => break,
            }
        }
    })
}

fn log_stage_failure(ctx: &RequestContext, err: &StageError, elapsed: Duration) {
    if err.kind == StageErrorKind::Cancelled {
        tracing::debug!(
            request_id = %ctx.id(),
            stage = %err.stage,
            "Stage abandoned after cancellation"
        );
        return;
    }
    tracing::warn!(
        request_id = %ctx.id(),
        stage = %err.stage,
        kind = %err.kind,
        elapsed_ms = elapsed.as_millis() as u64,
        error = %err.message,
        "Stage failed"
    );
}

/// Forward a stage failure unless the request was cancelled
///
/// Always returns `false` so callers can `return` it directly.
async fn emit_failure(ctx: &RequestContext, tx: &mpsc::Sender<StageResult>, err: StageError) -> bool {
    if ctx.is_cancelled() || err.kind == StageErrorKind::Cancelled {
        return false;
    }
    let _ = tx.send(StageResult::StageError(err)).await;
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockLlm, MockStt, MockTts};
    use bytes::Bytes;

    type Harness = (DialogueOrchestrator, Arc<MockStt>, Arc<MockLlm>, Arc<MockTts>);

    fn orchestrator(stt: MockStt, llm: MockLlm, tts: MockTts) -> Harness {
        let stt = Arc::new(stt);
        let llm = Arc::new(llm);
        let tts = Arc::new(tts);
        let orchestrator = DialogueOrchestrator::new(
            stt.clone(),
            llm.clone(),
            tts.clone(),
            &OrchestratorConfig::default(),
        );
        (orchestrator, stt, llm, tts)
    }

    fn request(stream_audio: bool) -> DialogueRequest {
        DialogueRequest {
            audio: TranscriptionRequest::new(vec![1u8; 16]),
            instructions: Some("Be brief.".to_string()),
            stream_audio,
            ..Default::default()
        }
    }

    async fn drain(mut rx: mpsc::Receiver<StageResult>) -> Vec<StageResult> {
        let mut out = Vec::new();
        while let Some(r) = rx.recv().await {
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn test_stream_emits_in_causal_order() {
        let (orch, _, llm, _) = orchestrator(
            MockStt::ok("what time is it"),
            MockLlm::ok("It is noon."),
            MockTts::ok(vec![
                Bytes::from_static(b"ab"),
                Bytes::from_static(b"cd"),
                Bytes::from_static(b"ef"),
            ]),
        );
        let ctx = RequestContext::new("o1", Duration::from_secs(5));
        let results = drain(orch.run(ctx, request(true))).await;

        assert_eq!(results.len(), 5);
        assert!(matches!(&results[0], StageResult::Transcript(t) if t.text == "what time is it"));
        assert!(matches!(&results[1], StageResult::AssistantText(t) if t == "It is noon."));
        let sequences: Vec<u64> = results[2..]
            .iter()
            .map(|r| match r {
                StageResult::AudioChunk { sequence, .. } => *sequence,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(
            llm.last_prompt().as_deref(),
            Some("Be brief.\n\nUser: what time is it\nAssistant:")
        );
    }

    #[tokio::test]
    async fn test_stt_failure_stops_pipeline() {
        let (orch, _, llm, tts) = orchestrator(
            MockStt::failing(StageError::unavailable(Stage::Stt, "down")),
            MockLlm::ok("unused"),
            MockTts::ok(vec![Bytes::from_static(b"x")]),
        );
        let ctx = RequestContext::new("o2", Duration::from_secs(5));
        let results = drain(orch.run(ctx, request(true))).await;

        assert_eq!(results.len(), 1);
        assert!(matches!(&results[0], StageResult::StageError(e) if e.stage == Stage::Stt));
        assert_eq!(llm.calls(), 0);
        assert_eq!(tts.calls(), 0);
    }

    #[tokio::test]
    async fn test_tts_failure_keeps_text() {
        let (orch, _, _, _) = orchestrator(
            MockStt::ok("hello"),
            MockLlm::ok("Hi there."),
            MockTts::failing(StageError::unavailable(Stage::Tts, "no voice")),
        );
        let ctx = RequestContext::new("o3", Duration::from_secs(5));
        let results = drain(orch.run(ctx, request(true))).await;

        assert_eq!(results.len(), 3);
        assert!(matches!(&results[2], StageResult::StageError(e) if e.stage == Stage::Tts));
    }

    #[tokio::test]
    async fn test_silent_synthesis_is_tts_error() {
        let (orch, _, _, tts) = orchestrator(
            MockStt::ok("hello"),
            MockLlm::ok("Hi."),
            MockTts::ok(vec![Bytes::new(), Bytes::new()]),
        );
        let ctx = RequestContext::new("o9", Duration::from_secs(5));
        let results = drain(orch.run(ctx, request(true))).await;

        assert_eq!(results.len(), 3);
        assert!(matches!(
            &results[2],
            StageResult::StageError(e) if e.stage == Stage::Tts && e.kind == StageErrorKind::Internal
        ));
        assert_eq!(tts.calls(), 1);
    }

    #[tokio::test]
    async fn test_buffered_degrades_on_tts_failure() {
        let (orch, _, _, _) = orchestrator(
            MockStt::ok("hello"),
            MockLlm::ok("  Hi there.  "),
            MockTts::failing(StageError::timeout(Stage::Tts)),
        );
        let ctx = RequestContext::new("o4", Duration::from_secs(5));
        let outcome = orch.run_buffered(&ctx, request(false)).await.unwrap();

        assert!(outcome.is_degraded());
        assert!(outcome.audio.is_none());
        assert_eq!(outcome.transcript.text, "hello");
        assert_eq!(outcome.response_text, "Hi there.");
        assert_eq!(outcome.audio_error.unwrap().kind, StageErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_buffered_llm_failure_is_error() {
        let (orch, _, _, tts) = orchestrator(
            MockStt::ok("hello"),
            MockLlm::failing(StageError::invalid_input(Stage::Llm, "bad prompt")),
            MockTts::ok(vec![Bytes::from_static(b"x")]),
        );
        let ctx = RequestContext::new("o5", Duration::from_secs(5));
        let err = orch.run_buffered(&ctx, request(false)).await.unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Llm));
        assert_eq!(tts.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout_is_reported() {
        let (orch, _, llm, _) = orchestrator(
            MockStt::ok("slow").with_delay(Duration::from_secs(30)),
            MockLlm::ok("unused"),
            MockTts::ok(vec![]),
        );
        let orch = orch.with_timeouts(StageTimeouts {
            stt: Duration::from_secs(1),
            ..Default::default()
        });
        let ctx = RequestContext::new("o6", Duration::from_secs(60));
        let results = drain(orch.run(ctx, request(true))).await;

        assert_eq!(results.len(), 1);
        assert!(matches!(
            &results[0],
            StageResult::StageError(e) if e.stage == Stage::Stt && e.kind == StageErrorKind::Timeout
        ));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_without_results() {
        let (orch, stt, llm, _) = orchestrator(
            MockStt::ok("never").with_delay(Duration::from_secs(30)),
            MockLlm::ok("unused"),
            MockTts::ok(vec![]),
        );
        let ctx = RequestContext::new("o7", Duration::from_secs(60));
        let rx = orch.run(ctx.clone(), request(true));
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();

        let results = drain(rx).await;
        assert!(results.is_empty());
        assert_eq!(stt.calls(), 1);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_buffered_audio_metadata_comes_from_synthesis() {
        let (orch, _, _, _) = orchestrator(
            MockStt::ok("hello"),
            MockLlm::ok("Hi."),
            MockTts::ok(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]),
        );
        let ctx = RequestContext::new("o8", Duration::from_secs(5));
        let outcome = orch.run_buffered(&ctx, request(false)).await.unwrap();

        let audio = outcome.audio.unwrap();
        assert_eq!(audio.audio.as_ref(), b"abcd");
        assert_eq!(outcome.metadata.response_format, "wav");
    }
}
