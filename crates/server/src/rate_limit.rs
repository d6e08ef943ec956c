//! Token-bucket rate limiting
//!
//! One bucket per identity, held in a process-wide [`BucketRegistry`]. Buckets
//! are keyed by API key when one is presented, else by client address; the two
//! scopes never share a bucket.
//!
//! Each admission locks only its own bucket, and does so while holding the
//! registry shard guard, so an idle sweep can never remove a bucket that is
//! being debited.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use voice_gateway_config::RateLimitConfig;
use voice_gateway_core::{Error, RequestIdentity};

use crate::error::ApiError;
use crate::state::AppState;
use crate::websocket::is_socket_route;

/// Admissions between idle-bucket sweeps
const SWEEP_INTERVAL: u64 = 1024;

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Allowed,
    Denied { retry_after_secs: f64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Registry key for one bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketKey {
    ApiKey(String),
    Address(String),
}

impl BucketKey {
    pub fn for_identity(identity: &RequestIdentity) -> Self {
        match &identity.api_key {
            Some(key) => BucketKey::ApiKey(key.clone()),
            None => BucketKey::Address(identity.client_address.clone()),
        }
    }

    /// Metrics label for the key's scope
    pub fn scope(&self) -> &'static str {
        match self {
            BucketKey::ApiKey(_) => "api_key",
            BucketKey::Address(_) => "address",
        }
    }
}

/// Token bucket state; `0 <= tokens <= capacity` always holds
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Refill, then debit one token if available
    pub fn try_acquire(&mut self, now: Instant) -> Admission {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Admission::Allowed
        } else {
            Admission::Denied {
                retry_after_secs: (1.0 - self.tokens) / self.refill_rate,
            }
        }
    }

    /// Tokens available at `now`, without mutating the bucket
    pub fn available(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    /// Full at `now` and untouched for at least `window`
    fn is_evictable(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_refill) >= window
            && self.available(now) >= self.capacity
    }
}

/// Process-wide bucket storage
///
/// Created at startup and handed to the [`RateLimiter`].
#[derive(Debug, Default)]
pub struct BucketRegistry {
    buckets: DashMap<BucketKey, Mutex<TokenBucket>>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Run `f` on the bucket for `key`, creating it with `init` if absent
    ///
    /// The shard guard is held for the duration of `f`. Lock order is always
    /// shard then bucket, matching [`BucketRegistry::evict_idle`].
    pub fn with_bucket<R>(
        &self,
        key: &BucketKey,
        init: impl FnOnce() -> TokenBucket,
        f: impl FnOnce(&mut TokenBucket) -> R,
    ) -> R {
        if let Some(bucket) = self.buckets.get(key) {
            let mut guard = bucket.value().lock();
            return f(&mut guard);
        }
        let bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Mutex::new(init()));
        let mut guard = bucket.value().lock();
        f(&mut guard)
    }

    /// Drop buckets that are full and have been idle for `window`
    pub fn evict_idle(&self, now: Instant, window: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| !bucket.lock().is_evictable(now, window));
        before.saturating_sub(self.buckets.len())
    }
}

/// Admission control keyed by caller identity
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    capacity: f64,
    refill_rate: f64,
    window: Duration,
    registry: Arc<BucketRegistry>,
    admissions: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, registry: Arc<BucketRegistry>) -> Self {
        let requests = f64::from(config.requests_per_window);
        Self {
            enabled: config.enabled,
            capacity: (requests * config.burst_multiplier).max(1.0),
            refill_rate: requests / config.window_seconds,
            window: Duration::from_secs_f64(config.window_seconds),
            registry,
            admissions: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.registry
    }

    pub fn admit(&self, identity: &RequestIdentity) -> Admission {
        self.admit_at(identity, Instant::now())
    }

    /// Admission check against an explicit clock reading
    pub fn admit_at(&self, identity: &RequestIdentity, now: Instant) -> Admission {
        if !self.enabled {
            return Admission::Allowed;
        }

        let key = BucketKey::for_identity(identity);
        let admission = self.registry.with_bucket(
            &key,
            || TokenBucket::new(self.capacity, self.refill_rate, now),
            |bucket| bucket.try_acquire(now),
        );

        if let Admission::Denied { retry_after_secs } = admission {
            metrics::counter!("rate_limit_rejections_total", "scope" => key.scope()).increment(1);
            tracing::debug!(
                scope = key.scope(),
                client = %identity.client_address,
                retry_after_secs,
                "Rate limit exceeded"
            );
        }

        if self.admissions.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            let evicted = self.registry.evict_idle(now, self.window);
            if evicted > 0 {
                tracing::debug!(evicted, "Evicted idle rate limit buckets");
            }
        }

        admission
    }
}

/// Rejects over-limit REST requests with 429
///
/// Socket routes are admitted inside their handlers so that denial can be
/// reported with a close code.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.rate_limiter.is_enabled()
        || state.is_public_path(request.uri().path())
        || is_socket_route(request.method(), request.uri().path())
    {
        return next.run(request).await;
    }

    let Some(identity) = request.extensions().get::<RequestIdentity>().cloned() else {
        tracing::error!("Request identity missing; auth middleware must run first");
        return ApiError::from(Error::Internal("request identity unavailable".into())).into_response();
    };

    match state.rate_limiter.admit(&identity) {
        Admission::Allowed => next.run(request).await,
        Admission::Denied { retry_after_secs } => {
            ApiError::from(Error::RateLimited { retry_after_secs }).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests: u32, window: f64, burst: f64) -> RateLimiter {
        RateLimiter::new(
            &RateLimitConfig {
                enabled: true,
                requests_per_window: requests,
                window_seconds: window,
                burst_multiplier: burst,
            },
            Arc::new(BucketRegistry::new()),
        )
    }

    fn caller(addr: &str) -> RequestIdentity {
        RequestIdentity::anonymous(addr)
    }

    #[test]
    fn test_third_call_denied_with_retry_after() {
        let limiter = limiter(2, 60.0, 1.0);
        let id = caller("10.0.0.1");
        let start = Instant::now();

        assert!(limiter.admit_at(&id, start).is_allowed());
        assert!(limiter.admit_at(&id, start + Duration::from_millis(300)).is_allowed());
        match limiter.admit_at(&id, start + Duration::from_millis(600)) {
            Admission::Denied { retry_after_secs } => {
                assert!((retry_after_secs - 30.0).abs() < 1.0, "got {}", retry_after_secs);
            }
            Admission::Allowed => panic!("third call should be denied"),
        }
    }

    #[test]
    fn test_refill_restores_full_capacity() {
        let limiter = limiter(4, 8.0, 1.0);
        let id = caller("10.0.0.2");
        let start = Instant::now();
        for _ in 0..4 {
            assert!(limiter.admit_at(&id, start).is_allowed());
        }
        assert!(!limiter.admit_at(&id, start).is_allowed());

        // capacity / refill_rate = 8s from empty
        let later = start + Duration::from_secs(8);
        for _ in 0..4 {
            assert!(limiter.admit_at(&id, later).is_allowed());
        }
        assert!(!limiter.admit_at(&id, later).is_allowed());
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(3.0, 1.0, start);
        assert!(bucket.try_acquire(start).is_allowed());
        assert_eq!(bucket.available(start + Duration::from_secs(3600)), 3.0);
    }

    #[test]
    fn test_burst_multiplier_scales_capacity() {
        assert_eq!(limiter(10, 60.0, 1.5).capacity(), 15.0);
        assert_eq!(limiter(1, 60.0, 0.2).capacity(), 1.0);
    }

    #[test]
    fn test_identities_do_not_share_buckets() {
        let limiter = limiter(1, 60.0, 1.0);
        let now = Instant::now();
        let keyed = RequestIdentity::new(Some("k1".into()), "10.0.0.3");
        let anon = caller("10.0.0.3");

        assert!(limiter.admit_at(&keyed, now).is_allowed());
        assert!(limiter.admit_at(&anon, now).is_allowed());
        assert!(!limiter.admit_at(&keyed, now).is_allowed());
        assert_eq!(limiter.registry().len(), 2);
    }

    #[test]
    fn test_disabled_always_allows() {
        let limiter = RateLimiter::new(&RateLimitConfig::default(), Arc::new(BucketRegistry::new()));
        let id = caller("10.0.0.4");
        for _ in 0..1000 {
            assert!(limiter.admit(&id).is_allowed());
        }
        assert!(limiter.registry().is_empty());
    }

    #[test]
    fn test_eviction_requires_full_and_idle() {
        let limiter = limiter(2, 10.0, 1.0);
        let start = Instant::now();
        limiter.admit_at(&caller("a"), start);
        limiter.admit_at(&caller("b"), start);
        limiter.admit_at(&caller("b"), start + Duration::from_secs(9));

        let evicted = limiter
            .registry()
            .evict_idle(start + Duration::from_secs(12), Duration::from_secs(10));
        assert_eq!(evicted, 1);
        assert_eq!(limiter.registry().len(), 1);
    }

    #[test]
    fn test_concurrent_admissions_never_overdraw() {
        let limiter = Arc::new(limiter(50, 3600.0, 1.0));
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.admit_at(&caller("shared"), now).is_allowed())
                        .count()
                })
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
    }

    #[test]
    fn test_concurrent_sweeps_never_refill_a_debited_bucket() {
        let limiter = Arc::new(limiter(50, 3600.0, 1.0));
        let now = Instant::now();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        // A zero window makes any full bucket evictable immediately
        let sweeper = {
            let limiter = Arc::clone(&limiter);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    limiter.registry().evict_idle(now, Duration::ZERO);
                }
            })
        };
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.admit_at(&caller("swept"), now).is_allowed())
                        .count()
                })
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        stop.store(true, Ordering::Relaxed);
        sweeper.join().unwrap();

        assert_eq!(allowed, 50);
    }
}
