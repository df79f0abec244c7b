//! Reconnect backoff.

use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Computes how long to wait before reconnect attempt `attempt + 1`.
pub trait Delayer: Send + Sync + fmt::Debug {
    /// Delay after `attempt` consecutive failures (0-based).
    fn delay_after(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with proportional jitter.
///
/// `base(n) = min(min_delay * exp^n, max_delay)` and the delay is drawn from
/// `[base(n), base(n) * (1 + jitter)]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpBackoff {
    /// Delay after the first failure.
    pub min_delay: Duration,
    /// Ceiling for the base delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub exp: f64,
    /// Jitter as a fraction of the base delay.
    pub jitter: f64,
}

impl Default for ExpBackoff {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(2 * 60),
            exp: 2.0,
            jitter: 0.1,
        }
    }
}

impl ExpBackoff {
    /// Creates a backoff.
    pub fn new(min_delay: Duration, max_delay: Duration, exp: f64, jitter: f64) -> Self {
        Self {
            min_delay,
            max_delay,
            exp,
            jitter,
        }
    }

    /// The delay before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let power = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.min_delay.as_secs_f64() * self.exp.max(1.0).powi(power);
        if !secs.is_finite() || secs >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Delayer for ExpBackoff {
    fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=jitter);
        base + base.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delays_grow_until_the_ceiling() {
        let backoff = ExpBackoff::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..=7 {
            let delay = backoff.delay_after(attempt);
            assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            previous = delay;
        }
        assert_eq!(backoff.base_delay(7), Duration::from_secs(120));
    }

    #[test]
    fn ceiling_holds_for_huge_attempts() {
        let backoff = ExpBackoff::default();
        let delay = backoff.delay_after(u32::MAX);
        assert!(delay >= backoff.max_delay);
        assert!(delay <= backoff.max_delay.mul_f64(1.1));
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let backoff = ExpBackoff::new(Duration::from_secs(1), Duration::from_secs(100), 3.0, 0.0);
        assert_eq!(backoff.delay_after(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_after(2), Duration::from_secs(9));
        assert_eq!(backoff.delay_after(10), Duration::from_secs(100));
    }

    proptest! {
        #[test]
        fn delay_stays_within_jitter_band(
            attempt in 0u32..64,
            min_ms in 1u64..5_000,
            jitter in 0.0f64..1.0,
        ) {
            let backoff = ExpBackoff::new(
                Duration::from_millis(min_ms),
                Duration::from_secs(120),
                2.0,
                jitter,
            );
            let base = backoff.base_delay(attempt);
            let delay = backoff.delay_after(attempt);
            prop_assert!(delay >= base);
            prop_assert!(delay <= base + base.mul_f64(jitter) + Duration::from_nanos(1));
        }

        #[test]
        fn base_delay_is_monotonic(attempt in 0u32..1_000, min_ms in 1u64..10_000) {
            let backoff = ExpBackoff::new(
                Duration::from_millis(min_ms),
                Duration::from_secs(300),
                1.5,
                0.1,
            );
            prop_assert!(backoff.base_delay(attempt + 1) >= backoff.base_delay(attempt));
            prop_assert!(backoff.base_delay(attempt) <= backoff.max_delay);
        }
    }
}
