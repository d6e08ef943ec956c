//! Per-request correlation id, deadline and cancellation
//!
//! A `RequestContext` is created once per inbound call. Stage calls receive a
//! child whose deadline is the tighter of the parent deadline and the stage
//! timeout, and whose cancellation is linked to the parent.

use crate::error::{Stage, StageError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Debug, Clone)]
pub struct RequestContext {
    id: Arc<str>,
    deadline: Instant,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(id: impl Into<Arc<str>>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Context with a fresh UUID v4 id
    pub fn with_generated_id(timeout: Duration) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), timeout)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once this context (or any ancestor) is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Derive a stage context bounded by `timeout`
    pub fn child(&self, timeout: Duration) -> Self {
        let stage_deadline = Instant::now() + timeout;
        Self {
            id: Arc::clone(&self.id),
            deadline: stage_deadline.min(self.deadline),
            cancel: self.cancel.child_token(),
        }
    }

    /// Guard that cancels this context when dropped
    pub fn drop_guard(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }

    /// Run `fut` until it completes, the deadline passes or the context is cancelled
    pub async fn bound<T, F>(&self, stage: Stage, fut: F) -> Result<T, StageError>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StageError::cancelled(stage)),
            res = tokio::time::timeout_at(self.deadline, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(StageError::timeout(stage)),
            },
        }
    }

    /// Wait for an engine concurrency permit within this context's bounds
    pub async fn acquire(
        &self,
        stage: Stage,
        limiter: &Arc<Semaphore>,
    ) -> Result<OwnedSemaphorePermit, StageError> {
        let limiter = Arc::clone(limiter);
        self.bound(stage, async move {
            limiter
                .acquire_owned()
                .await
                .map_err(|_| StageError::unavailable(stage, "engine is shutting down"))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageErrorKind;

    #[tokio::test(start_paused = true)]
    async fn test_bound_times_out() {
        let ctx = RequestContext::new("req-1", Duration::from_secs(5));
        let stage = ctx.child(Duration::from_millis(100));
        let res: Result<(), _> = stage
            .bound(Stage::Stt, async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert_eq!(res.unwrap_err().kind, StageErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let ctx = RequestContext::new("req-2", Duration::from_secs(5));
        let stage = ctx.child(Duration::from_secs(5));
        ctx.cancel();
        assert!(stage.is_cancelled());
        let res: Result<(), _> = stage
            .bound(Stage::Llm, futures::future::pending())
            .await;
        assert_eq!(res.unwrap_err().kind, StageErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_child_deadline_never_exceeds_parent() {
        let ctx = RequestContext::new("req-3", Duration::from_secs(1));
        let stage = ctx.child(Duration::from_secs(60));
        assert!(stage.deadline() <= ctx.deadline());
        assert_eq!(stage.id(), "req-3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_within_deadline() {
        let limiter = Arc::new(Semaphore::new(1));
        let ctx = RequestContext::new("req-4", Duration::from_millis(50));
        let held = ctx.acquire(Stage::Tts, &limiter).await.unwrap();
        let err = ctx.acquire(Stage::Tts, &limiter).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Timeout);
        drop(held);
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_drop_guard_cancels() {
        let ctx = RequestContext::with_generated_id(Duration::from_secs(1));
        {
            let _guard = ctx.drop_guard();
        }
        assert!(ctx.is_cancelled());
    }
}
