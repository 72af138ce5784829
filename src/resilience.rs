// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write throttling for the sink.
//!
//! A replication run can push thousands of inserts in a burst right after a
//! backlog builds up. [`RateLimiter`] caps that with a token bucket so the
//! analytical store sees a steady write rate.
//!
//! ```rust,no_run
//! # async fn example() {
//! use audit_replicator::resilience::{RateLimiter, RateLimitConfig};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Waits if over limit
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;

/// Token bucket parameters.
///
/// Tokens refill at `refill_rate` per second, up to `burst_size` tokens.
/// Each sink write consumes one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 writes/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait until a token is available. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_burst_then_exhausted() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 5,
            refill_rate: 1,
        });

        let burst = tokio::time::timeout(Duration::from_millis(200), async {
            for _ in 0..5 {
                limiter.acquire().await;
            }
        });
        assert!(burst.await.is_ok(), "burst should not wait");
        assert!(tokio::time::timeout(Duration::from_millis(50), limiter.acquire())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_zero_config_clamps_to_one() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 0,
            refill_rate: 0,
        });
        assert!(tokio::time::timeout(Duration::from_millis(200), limiter.acquire())
            .await
            .is_ok());
        assert!(tokio::time::timeout(Duration::from_millis(50), limiter.acquire())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 1,
            refill_rate: 20,
        });

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        // Second token refills after ~50ms.
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(limiter.config().refill_rate, 20);
    }
}
