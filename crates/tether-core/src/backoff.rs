//! Randomized exponential backoff.
//!
//! Each call to [`Backoff::delay`] draws a delay uniformly from
//! `[0, min(2 × base × 2^attempt, max))` and bumps `attempt`. If more than
//! `reset` has passed since the previous call, the attempt counter starts
//! over, so a peer that has been healthy for a while backs off from the
//! bottom again.
//!
//! # Example
//!
//! ```
//! use tether_core::Backoff;
//! use std::time::Duration;
//!
//! let mut backoff = Backoff::new(
//!     Duration::from_secs(1),
//!     Duration::from_secs(60),
//!     Duration::from_secs(120),
//! );
//! assert!(backoff.delay() < Duration::from_secs(2));
//! assert!(backoff.delay() < Duration::from_secs(4));
//! ```

use rand::Rng;
use std::time::{Duration, Instant};

/// Exponential backoff with full jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    reset: Duration,
    attempt: u32,
    last_invoke: Option<Instant>,
}

impl Backoff {
    /// Create a backoff starting at `base`, capped at `max`, forgetting
    /// previous attempts after `reset` of quiet time
    #[must_use]
    pub const fn new(base: Duration, max: Duration, reset: Duration) -> Self {
        Self {
            base,
            max,
            reset,
            attempt: 0,
            last_invoke: None,
        }
    }

    /// Next delay, advancing the attempt counter
    pub fn delay(&mut self) -> Duration {
        self.delay_at(Instant::now())
    }

    /// Next delay as if called at `now`
    pub fn delay_at(&mut self, now: Instant) -> Duration {
        if let Some(last) = self.last_invoke {
            if now.saturating_duration_since(last) > self.reset {
                self.attempt = 0;
            }
        }
        self.last_invoke = Some(now);

        let upper = self.upper_bound();
        self.attempt = self.attempt.saturating_add(1);

        let upper_ms = upper.as_secs_f64() * 1000.0;
        if upper_ms <= 0.0 {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(0.0..upper_ms);
        Duration::from_secs_f64(ms / 1000.0)
    }

    /// Exclusive upper bound of the next delay
    #[must_use]
    pub fn upper_bound(&self) -> Duration {
        // 2^attempt overflows f64 precision long before it matters; clamp the exponent
        let factor = 2f64.powi(self.attempt.min(62) as i32);
        let scaled = self.base.as_secs_f64() * 2.0 * factor;
        if scaled >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Number of delays handed out since the last reset
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forget previous attempts
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_invoke = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn backoff() -> Backoff {
        Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_secs(120),
        )
    }

    #[test]
    fn test_bounds_grow_until_max() {
        let mut b = backoff();
        let now = Instant::now();
        let expected = [2u64, 4, 8, 16, 32, 60, 60, 60];
        for (i, secs) in expected.iter().enumerate() {
            assert_eq!(b.upper_bound(), Duration::from_secs(*secs), "attempt {i}");
            b.delay_at(now + Duration::from_secs(i as u64));
        }
    }

    #[test]
    fn test_quiet_gap_resets_attempt() {
        let mut b = backoff();
        let start = Instant::now();
        for i in 0..6 {
            b.delay_at(start + Duration::from_secs(i));
        }
        assert_eq!(b.attempt(), 6);

        let later = start + Duration::from_secs(5 + 121);
        let delay = b.delay_at(later);
        assert_eq!(b.attempt(), 1);
        assert!(delay < Duration::from_secs(2));
    }

    #[test]
    fn test_gap_equal_to_reset_does_not_reset() {
        let mut b = backoff();
        let start = Instant::now();
        b.delay_at(start);
        b.delay_at(start + Duration::from_secs(120));
        assert_eq!(b.attempt(), 2);
    }

    #[test]
    fn test_zero_base() {
        let mut b = Backoff::new(Duration::ZERO, Duration::from_secs(5), Duration::from_secs(5));
        assert_eq!(b.delay(), Duration::ZERO);
    }

    #[test]
    fn test_manual_reset() {
        let mut b = backoff();
        b.delay();
        b.delay();
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.upper_bound(), Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_max(calls in 1usize..200) {
            let mut b = backoff();
            let start = Instant::now();
            for i in 0..calls {
                let delay = b.delay_at(start + Duration::from_millis(i as u64 * 10));
                prop_assert!(delay <= Duration::from_secs(60));
            }
        }
    }
}
