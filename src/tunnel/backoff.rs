//! Jittered exponential reconnect delay.

use std::time::Duration;

use rand::Rng;

/// Doubling delay starting at `base`, capped at `max`, with each delay drawn
/// uniformly from the upper half of the current step so that many clients
/// dropped by the same relay restart do not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    streak: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            streak: 0,
        }
    }

    /// Forget previous failures (called once a connection is established).
    pub fn reset(&mut self) {
        self.streak = 0;
    }

    /// Upper bound of the next delay, without advancing.
    pub fn ceiling(&self) -> Duration {
        let factor = 1u32 << self.streak.min(16);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before the next attempt; advances the failure streak.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = millis(self.ceiling());
        self.streak = self.streak.saturating_add(1);
        let floor = ceiling / 2;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(floor..=ceiling))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_cap() {
        let mut b = Backoff::new(Duration::from_secs(5), Duration::from_secs(30));
        let expected = [5, 10, 20, 30, 30, 30];
        for ceiling in expected {
            assert_eq!(b.ceiling(), Duration::from_secs(ceiling));
            let d = b.next_delay();
            assert!(d <= Duration::from_secs(ceiling), "{d:?} > {ceiling}s");
            assert!(d >= Duration::from_millis(ceiling * 500), "{d:?} < half of {ceiling}s");
        }
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(30));
        for _ in 0..10 {
            b.next_delay();
        }
        assert_eq!(b.ceiling(), Duration::from_secs(30));
        b.reset();
        assert_eq!(b.ceiling(), Duration::from_millis(100));
    }

    #[test]
    fn test_cap_below_base_is_raised() {
        let b = Backoff::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(b.ceiling(), Duration::from_secs(10));
    }

    #[test]
    fn test_long_streak_does_not_overflow() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..100 {
            assert!(b.next_delay() <= Duration::from_secs(30));
        }
    }
}
