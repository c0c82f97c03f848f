//! Exponential backoff with jitter for broker reconnect loops.

use std::time::Duration;

use banter_settings::RetrySettings;
use rand::Rng;

/// Exponential backoff schedule.
///
/// Each call to [`next_delay`](ExponentialBackoff::next_delay) doubles the
/// previous delay up to a ceiling, then adds a random jitter slice so a
/// fleet of instances does not reconnect in lockstep.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Builds a schedule from retry settings.
    pub fn new(retry: &RetrySettings) -> Self {
        Self {
            base: Duration::from_millis(retry.base_delay_ms),
            max: Duration::from_millis(retry.max_delay_ms),
            jitter_factor: retry.jitter_factor.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Returns the delay to sleep before the next attempt and advances
    /// the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let raw = self.base.saturating_mul(2u32.saturating_pow(exp)).min(self.max);
        if self.jitter_factor <= f64::EPSILON {
            return raw;
        }
        let jitter_span = raw.as_secs_f64() * self.jitter_factor;
        let jitter = rand::rng().random_range(0.0..=jitter_span);
        raw + Duration::from_secs_f64(jitter)
    }

    /// Resets the schedule after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetrySettings {
        RetrySettings {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn delays_double_until_capped() {
        let mut backoff = ExponentialBackoff::new(&no_jitter());
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = ExponentialBackoff::new(&no_jitter());
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_the_configured_span() {
        let retry = RetrySettings {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_factor: 0.5,
        };
        let mut backoff = ExponentialBackoff::new(&retry);
        for _ in 0..32 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn large_attempt_counts_do_not_overflow() {
        let mut backoff = ExponentialBackoff::new(&no_jitter());
        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(1_000));
        }
    }
}
