//! Per-host request spacing
//!
//! One governor bucket per host with a burst of one, so two navigations to
//! the same host are never closer than the configured period. Different
//! hosts do not wait on each other.

use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tracing::debug;

pub struct HostRateLimiter {
    /// `None` when spacing is zero
    limiter: Option<DefaultKeyedRateLimiter<String>>,
    spacing: Duration,
}

impl HostRateLimiter {
    pub fn new(spacing: Duration) -> Self {
        let limiter = Quota::with_period(spacing).map(RateLimiter::keyed);
        Self { limiter, spacing }
    }

    pub const fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Wait until `host` may be hit again
    pub async fn until_ready(&self, host: &str) {
        if let Some(limiter) = &self.limiter {
            let key = host.to_ascii_lowercase();
            if limiter.check_key(&key).is_err() {
                debug!("Rate limiting {} ({:?} spacing)", key, self.spacing);
                limiter.until_key_ready(&key).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_same_host_is_spaced() {
        let limiter = HostRateLimiter::new(Duration::from_millis(100));
        let started = Instant::now();
        limiter.until_ready("shop.example").await;
        limiter.until_ready("SHOP.example").await;
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_hosts_are_independent() {
        let limiter = HostRateLimiter::new(Duration::from_secs(5));
        let started = Instant::now();
        limiter.until_ready("a.example").await;
        limiter.until_ready("b.example").await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_zero_spacing_never_waits() {
        let limiter = HostRateLimiter::new(Duration::ZERO);
        for _ in 0..10 {
            limiter.until_ready("a.example").await;
        }
        assert_eq!(limiter.spacing(), Duration::ZERO);
    }
}
