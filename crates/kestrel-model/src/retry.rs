// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Retry-with-backoff (§4.B "Retry policy", §7, §8 P10).
//!
//! Lives with the *caller* of the transport, not the transport itself —
//! the transport only classifies errors; this module decides whether and
//! how long to wait before trying again.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::cancel::Scope;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter_cap: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            jitter_cap: Duration::from_millis(250),
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `k` (1-indexed): base * 2^(k-1), plus bounded
    /// jitter in `[0, jitter_cap]` (§8 P10).
    pub fn delay_for_attempt(&self, k: u32) -> Duration {
        let exp = self.base_delay.as_millis() as u64 * 2u64.saturating_pow(k.saturating_sub(1));
        let jitter = if self.jitter_cap.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_cap.as_millis() as u64)
        };
        Duration::from_millis(exp.saturating_add(jitter))
    }
}

/// Sleep for `dur`, but resolve early (returning `true`) if `scope` is
/// cancelled first. Every backoff sleep in this crate goes through this so
/// no retry loop can outlive a cancelled request (§5 "every sleep is itself
/// cancellable").
pub async fn cancellable_sleep(dur: Duration, scope: &Scope) -> bool {
    let handle = scope.handle();
    tokio::select! {
        biased;
        _ = handle.cancelled() => true,
        _ = tokio::time::sleep(dur) => false,
    }
}

/// Retry `call` according to `cfg`. `call` must itself be cancellation-aware
/// (it receives the scope); this function only adds the backoff-and-retry
/// envelope around it.
pub async fn retry_with_backoff<F, Fut, T>(
    cfg: RetryConfig,
    scope: &Scope,
    mut call: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        if scope.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= cfg.max_attempts => return Err(e),
            Err(e) => {
                tracing::warn!(attempt, max = cfg.max_attempts, error = %e, "retrying after transport error");
                let dur = cfg.delay_for_attempt(attempt);
                if cancellable_sleep(dur, scope).await {
                    return Err(TransportError::Aborted);
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn delay_grows_exponentially_within_jitter_bound() {
        let cfg = RetryConfig { max_attempts: 5, base_delay: Duration::from_millis(100), jitter_cap: Duration::from_millis(50) };
        for k in 1..=4u32 {
            let d = cfg.delay_for_attempt(k).as_millis() as u64;
            let base = 100u64 * 2u64.pow(k - 1);
            assert!(d >= base && d <= base + 50, "attempt {k}: {d} not in [{base}, {}]", base + 50);
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let cfg = RetryConfig { max_attempts: 3, base_delay: Duration::from_millis(10), jitter_cap: Duration::ZERO };
        assert_eq!(cfg.delay_for_attempt(1).as_millis(), 10);
        assert_eq!(cfg.delay_for_attempt(2).as_millis(), 20);
        assert_eq!(cfg.delay_for_attempt(3).as_millis(), 40);
    }

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let scope = Scope::new(None, None);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry_with_backoff(RetryConfig::default(), &scope, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TransportError>(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_retryable_error_up_to_cap() {
        let scope = Scope::new(None, None);
        let cfg = RetryConfig { max_attempts: 3, base_delay: Duration::from_millis(1), jitter_cap: Duration::ZERO };
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<i32, _> = retry_with_backoff(cfg, &scope, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::HttpStatus(503, "x".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let scope = Scope::new(None, None);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<i32, _> = retry_with_backoff(RetryConfig::default(), &scope, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::HttpStatus(403, "nope".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_scope_short_circuits_before_first_call() {
        let scope = Scope::new(None, None);
        scope.abort();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<i32, _> = retry_with_backoff(RetryConfig::default(), &scope, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            }
        })
        .await;
        assert!(matches!(result, Err(TransportError::Aborted)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellable_sleep_returns_early_when_scope_aborted() {
        let scope = Scope::new(None, None);
        scope.abort();
        let cancelled = cancellable_sleep(Duration::from_secs(30), &scope).await;
        assert!(cancelled);
    }
}
