//! Rate Limiter Module
//!
//! Token-bucket admission control for fetch functions, built on governor.

use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota};
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::error::{CacheError, Result};

// == Rate Limiter ==
/// Shared limiter that delays, but never rejects, fetch executions.
///
/// One cell of the bucket is replenished every `1 / rate_per_sec` seconds and
/// up to `burst` cells can be spent back to back.
pub struct RateLimiter {
    inner: DefaultDirectRateLimiter,
    config: RateLimitConfig,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    // == Constructor ==
    /// Creates a limiter from validated rate/burst parameters.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;

        let burst = NonZeroU32::new(config.burst)
            .ok_or_else(|| CacheError::InvalidConfig("burst must be greater than 0".to_string()))?;
        let period = Duration::try_from_secs_f64(1.0 / config.rate_per_sec).map_err(|_| {
            CacheError::InvalidConfig(format!("rate {} is too small", config.rate_per_sec))
        })?;
        let quota = Quota::with_period(period)
            .ok_or_else(|| {
                CacheError::InvalidConfig(format!("rate {} is too large", config.rate_per_sec))
            })?
            .allow_burst(burst);

        Ok(Self {
            inner: DefaultDirectRateLimiter::direct(quota),
            config,
        })
    }

    // == Wait ==
    /// Waits until a token is available.
    ///
    /// Returns `true` once admitted, or `false` if `cancel` fired first.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.inner.until_ready() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn limiter(rate_per_sec: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            rate_per_sec,
            burst,
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        let zero_burst = RateLimiter::new(RateLimitConfig {
            rate_per_sec: 1.0,
            burst: 0,
        });
        assert!(matches!(zero_burst, Err(CacheError::InvalidConfig(_))));

        let zero_rate = RateLimiter::new(RateLimitConfig {
            rate_per_sec: 0.0,
            burst: 1,
        });
        assert!(zero_rate.is_err());
    }

    #[tokio::test]
    async fn test_burst_is_admitted_immediately() {
        let limiter = limiter(1.0, 3);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        for _ in 0..3 {
            assert!(limiter.wait(&cancel).await);
        }
        assert!(start.elapsed() < Duration::from_millis(100));

        let exhausted =
            tokio::time::timeout(Duration::from_millis(100), limiter.wait(&cancel)).await;
        assert!(exhausted.is_err(), "Burst should be exhausted");
    }

    #[tokio::test]
    async fn test_wait_delays_after_burst() {
        let limiter = limiter(10.0, 1);
        let cancel = CancellationToken::new();

        assert!(limiter.wait(&cancel).await);

        let start = Instant::now();
        assert!(limiter.wait(&cancel).await);
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(70),
            "Expected a delay of ~100ms, got {:?}",
            elapsed
        );
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_wait_returns_false_when_cancelled() {
        let limiter = limiter(0.5, 1);
        let cancel = CancellationToken::new();
        assert!(limiter.wait(&cancel).await);

        let waiter = {
            let cancel = cancel.clone();
            async move { limiter.wait(&cancel).await }
        };
        let handle = tokio::spawn(waiter);

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let admitted = tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("wait should return after cancellation")
            .unwrap();
        assert!(!admitted);
    }
}
