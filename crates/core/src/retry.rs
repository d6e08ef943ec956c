//! Bounded exponential backoff for adapter calls

use crate::context::RequestContext;
use crate::error::{Stage, StageError};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            ..Default::default()
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error or retries run out
    ///
    /// Backoff sleeps stop early when the context is cancelled.
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        stage: Stage,
        mut op: F,
    ) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        request_id = %ctx.id(),
                        stage = %stage,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying upstream call"
                    );
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(StageError::cancelled(stage)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_unavailable_then_succeeds() {
        let ctx = RequestContext::new("r", Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let res = RetryPolicy::new(3, Duration::from_millis(10))
            .run(&ctx, Stage::Tts, || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(StageError::unavailable(Stage::Tts, "refused"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_input_not_retried() {
        let ctx = RequestContext::new("r", Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = RetryPolicy::new(3, Duration::from_millis(1))
            .run(&ctx, Stage::Stt, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StageError::invalid_input(Stage::Stt, "bad")) }
            })
            .await;
        assert_eq!(res.unwrap_err().kind, StageErrorKind::InvalidInput);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
