//! Per-client admission limiter guarding the reservation endpoint.
//!
//! One token bucket per client identity, refilled at a fixed rate with a fixed
//! burst. Buckets live in governor's sharded keyed store, so unrelated clients
//! never contend on a single lock.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::observability;

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("rate must be a positive number of tokens per second, got {0}")]
    Rate(f64),
    #[error("burst must be at least 1")]
    Burst,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Limited { retry_after: Duration },
}

pub struct AdmissionLimiter {
    buckets: DefaultKeyedRateLimiter<String>,
    clock: DefaultClock,
}

impl std::fmt::Debug for AdmissionLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionLimiter")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl AdmissionLimiter {
    /// `rate` tokens per second, at most `burst` stored.
    pub fn new(rate: f64, burst: u32) -> Result<Self, LimiterError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(LimiterError::Rate(rate));
        }
        let period = Duration::try_from_secs_f64(1.0 / rate).map_err(|_| LimiterError::Rate(rate))?;
        let burst = NonZeroU32::new(burst).ok_or(LimiterError::Burst)?;
        let quota = Quota::with_period(period)
            .ok_or(LimiterError::Rate(rate))?
            .allow_burst(burst);
        Ok(Self {
            buckets: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
        })
    }

    /// Take one token from `identity`'s bucket, creating the bucket on first use.
    pub fn check(&self, identity: &str) -> Decision {
        match self.buckets.check_key(&identity.to_string()) {
            Ok(()) => Decision::Allowed,
            Err(not_until) => Decision::Limited {
                retry_after: not_until.wait_time_from(self.clock.now()),
            },
        }
    }

    pub fn allow(&self, identity: &str) -> bool {
        self.check(identity) == Decision::Allowed
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets that have refilled completely. Such a bucket behaves
    /// exactly like a fresh one, so no admission decision changes.
    pub fn evict_idle(&self) -> usize {
        let before = self.buckets.len();
        self.buckets.retain_recent();
        self.buckets.shrink_to_fit();
        let after = self.buckets.len();
        metrics::gauge!(observability::LIMITER_BUCKETS).set(after as f64);
        before.saturating_sub(after)
    }
}

/// Background task that periodically evicts idle buckets.
pub async fn run_evictor(
    limiter: Arc<AdmissionLimiter>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let evicted = limiter.evict_idle();
        if evicted > 0 {
            debug!(evicted, remaining = limiter.len(), "evicted idle limiter buckets");
        }
    }
}

/// Who is asking: first `X-Forwarded-For` entry, else `X-Real-IP`, else the
/// transport peer's IP.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    if let Some(first) = header("x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    if let Some(real) = header("x-real-ip") {
        return real.to_string();
    }
    peer.map_or_else(|| "unknown".to_string(), |p| p.ip().to_string())
}

/// Axum middleware: reject with 429 before the handler runs.
pub async fn limit_middleware(
    State(limiter): State<Arc<AdmissionLimiter>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = client_identity(req.headers(), peer);

    match limiter.check(&identity) {
        Decision::Allowed => next.run(req).await,
        Decision::Limited { retry_after } => {
            warn!(
                client = %identity,
                path = %req.uri().path(),
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limit exceeded"
            );
            metrics::counter!(observability::RATE_LIMITED_TOTAL).increment(1);
            limited_response(retry_after)
        }
    }
}

fn limited_response(retry_after: Duration) -> Response {
    let body = serde_json::json!({
        "code": "RATE_LIMITED",
        "message": "too many requests",
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
    // Whole seconds, rounded up so a client never retries too early.
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    if let Ok(v) = HeaderValue::from_str(&secs.max(1).to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, v);
    }
    response
}
