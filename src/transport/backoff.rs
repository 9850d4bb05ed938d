//! Reconnect delay schedule

use std::time::Duration;

use rand::Rng;

use crate::config::TransportConfig;

/// Exponential backoff with a cap and additive random jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: Duration) -> Self {
        Self { base, cap, jitter }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            Duration::from_millis(config.jitter_ms),
        )
    }

    /// `min(base * 2^(attempt-1), cap)` without jitter; attempts start at 1
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(1u32 << exponent);
        delay.min(self.cap)
    }

    /// Base delay plus a uniform jitter in `0..=jitter`
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay(attempt) + jitter
    }

    /// Upper bound of any delay this schedule produces
    pub fn max_delay(&self) -> Duration {
        self.cap + self.jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_backoff() -> Backoff {
        Backoff::from_config(&TransportConfig::default())
    }

    #[test]
    fn test_base_delay_doubles() {
        let backoff = default_backoff();
        assert_eq!(backoff.base_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff.base_delay(2), Duration::from_millis(2000));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(4000));
        assert_eq!(backoff.base_delay(5), Duration::from_millis(16000));
    }

    #[test]
    fn test_base_delay_capped() {
        let backoff = default_backoff();
        assert_eq!(backoff.base_delay(6), Duration::from_millis(30000));
        assert_eq!(backoff.base_delay(10), Duration::from_millis(30000));
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_millis(30000));
    }

    #[test]
    fn test_base_delay_is_monotonic() {
        let backoff = default_backoff();
        for n in 1..10 {
            assert!(backoff.base_delay(n) <= backoff.base_delay(n + 1));
        }
    }

    #[test]
    fn test_jittered_delay_bounds() {
        let backoff = default_backoff();
        for n in 1..=10 {
            let delay = backoff.delay(n);
            assert!(delay >= backoff.base_delay(n));
            assert!(delay <= backoff.base_delay(n) + Duration::from_millis(1000));
            assert!(delay <= backoff.max_delay());
        }
    }

    #[test]
    fn test_zero_jitter() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(100), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(7), Duration::from_millis(100));
    }
}
