//! Exponential backoff with jitter

use std::time::Duration;

use crate::infrastructure::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            max: Duration::from_millis(config.max_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// `min(base * multiplier^(attempt-1), max)` without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled_ms = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        if !scaled_ms.is_finite() || scaled_ms >= self.max.as_millis() as f64 {
            self.max
        } else {
            Duration::from_millis(scaled_ms.round() as u64)
        }
    }

    /// Base delay spread by up to `jitter` in either direction, still capped at `max`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + self.jitter * (fastrand::f64() * 2.0 - 1.0);
        base.mul_f64(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy::new(&BackoffConfig {
            base_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter,
        })
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(4, 800)]
    #[case(5, 1_000)]
    #[case(60, 1_000)]
    fn test_base_delay(#[case] attempt: u32, #[case] millis: u64) {
        assert_eq!(policy(0.0).delay_for(attempt), Duration::from_millis(millis));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = policy(0.5);
        for _ in 0..200 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(300));
        }
    }
}
