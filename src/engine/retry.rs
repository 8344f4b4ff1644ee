// Rate-limit aware retry wrapper around fallible async operations.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::DEFAULT_MAX_RETRIES;
use crate::error::{RateLimitInfo, RateLimitSignal};

/// Called before each backoff wait with `(attempt, delay_ms, info)`; `attempt` is 1-based.
pub type RetryHook = Arc<dyn Fn(u32, u64, &RateLimitInfo) + Send + Sync>;

/// One-shot flag: starts unset, set by the first `fire`, cleared only by `reset`.
pub struct NoticeLatch {
    shown: AtomicBool,
}

impl NoticeLatch {
    pub const fn new() -> Self {
        Self {
            shown: AtomicBool::new(false),
        }
    }

    /// Returns `true` only for the first call since creation or the last reset.
    pub fn fire(&self) -> bool {
        !self.shown.swap(true, Ordering::AcqRel)
    }

    pub fn reset(&self) {
        self.shown.store(false, Ordering::Release);
    }
}

impl Default for NoticeLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide latch behind the rate-limit warning.
static RATE_LIMIT_NOTICE: NoticeLatch = NoticeLatch::new();

/// Emit the rate-limit warning once per process. Returns `true` when it was emitted.
pub fn notify_rate_limited() -> bool {
    let first = RATE_LIMIT_NOTICE.fire();
    if first {
        warn!("server is rate limiting requests; transfers will slow down while we wait");
    }
    first
}

/// Re-arm the process-wide notice so the next rate limit warns again.
pub fn reset_rate_limit_notice() {
    RATE_LIMIT_NOTICE.reset();
}

#[derive(Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub on_retry: Option<RetryHook>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            on_retry: None,
        }
    }
}

impl RetryOptions {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            on_retry: None,
        }
    }

    pub fn on_retry(mut self, hook: RetryHook) -> Self {
        self.on_retry = Some(hook);
        self
    }
}

/// Per-call retry bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
struct RetryContext {
    attempt: u32,
    max_retries: u32,
    last_delay_ms: u64,
}

/// Run `operation`, waiting out server rate limits.
///
/// Only errors carrying a rate-limit signal are retried; everything else is returned on
/// first failure. After `max_retries` rate-limited attempts the operation runs one more
/// time and its result is returned as is, so permanent rate limiting costs
/// `max_retries + 1` calls.
pub async fn retry_with_backoff<T, E, F, Fut>(mut operation: F, options: RetryOptions) -> Result<T, E>
where
    E: RateLimitSignal,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut ctx = RetryContext {
        max_retries: options.max_retries,
        ..RetryContext::default()
    };

    while ctx.attempt < ctx.max_retries {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let Some(info) = err.rate_limit() else {
            return Err(err);
        };

        ctx.attempt += 1;
        ctx.last_delay_ms = info.reset_ms;
        if let Some(hook) = &options.on_retry {
            hook(ctx.attempt, info.reset_ms, &info);
        }
        notify_rate_limited();
        debug!(
            "rate limited, attempt {}/{} waiting {} ms",
            ctx.attempt, ctx.max_retries, ctx.last_delay_ms
        );
        tokio::time::sleep(Duration::from_millis(info.reset_ms)).await;
    }

    operation().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use parking_lot::Mutex;
    use reqwest::header::{HeaderMap, HeaderValue};
    use std::sync::atomic::AtomicU32;

    fn rate_limited(reset: &'static str) -> TransportError {
        let mut h = HeaderMap::new();
        h.insert("x-internxt-ratelimit-reset", HeaderValue::from_static(reset));
        TransportError::from_status(429, &h, "too many requests")
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_once_then_succeeds() {
        let calls = AtomicU32::new(0);
        let delays = Arc::new(Mutex::new(Vec::new()));
        let seen = delays.clone();
        let hook: RetryHook = Arc::new(move |attempt, delay, _info| seen.lock().push((attempt, delay)));
        let started = tokio::time::Instant::now();

        let result = retry_with_backoff(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(rate_limited("5000"))
                    } else {
                        Ok("done")
                    }
                }
            },
            RetryOptions::default().on_retry(hook),
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*delays.lock(), vec![(1, 5000)]);
        assert!(started.elapsed() >= Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_without_headers_fails_fast() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::from_status(429, &HeaderMap::new(), "too many")) }
            },
            RetryOptions::default(),
        )
        .await;

        assert!(matches!(result, Err(TransportError::Status { status: 429, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_rate_limit_makes_final_attempt() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(rate_limited("10")) }
            },
            RetryOptions::with_max_retries(2),
        )
        .await;

        assert!(matches!(result, Err(TransportError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_allows_six_calls() {
        let calls = AtomicU32::new(0);
        let _: Result<(), _> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(rate_limited("1")) }
            },
            RetryOptions::default(),
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_other_errors_propagate_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::Network("connection refused".into())) }
            },
            RetryOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(TransportError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_notice_latch_fires_once() {
        let latch = NoticeLatch::new();
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(!latch.fire());
        latch.reset();
        assert!(latch.fire());
    }
}
