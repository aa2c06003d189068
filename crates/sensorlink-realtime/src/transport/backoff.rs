use std::time::Duration;

use rand::Rng;

/// Exponential reconnect delay with optional jitter.
///
/// Delays never decrease between resets and never exceed the cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: bool,
    attempts: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: bool) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter,
            attempts: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempts.min(16);
        let raw = self.base.saturating_mul(1u32 << exp).min(self.cap);
        let delay = if self.jitter {
            let half = raw / 2;
            let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
            half + Duration::from_millis(spread)
        } else {
            raw
        };
        let delay = delay.max(self.last).min(self.cap);
        self.last = delay;
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last = Duration::ZERO;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn doubles_until_cap_without_jitter() {
        let mut b = Backoff::new(secs(1), secs(30), false);
        let delays: Vec<u64> = (0..8).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(b.attempts(), 8);
    }

    #[test]
    fn jittered_delays_are_monotonic_and_capped() {
        for _ in 0..50 {
            let mut b = Backoff::new(secs(1), secs(30), true);
            let mut prev = Duration::ZERO;
            for _ in 0..12 {
                let d = b.next_delay();
                assert!(d >= prev, "{d:?} < {prev:?}");
                assert!(d <= secs(30));
                assert!(d >= Duration::from_millis(500));
                prev = d;
            }
        }
    }

    #[test]
    fn reset_starts_over() {
        let mut b = Backoff::new(secs(1), secs(30), false);
        b.next_delay();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.next_delay(), secs(1));
    }

    #[test]
    fn cap_below_base_is_raised() {
        let mut b = Backoff::new(secs(5), secs(1), false);
        assert_eq!(b.next_delay(), secs(5));
        assert_eq!(b.next_delay(), secs(5));
    }

    #[test]
    fn many_attempts_do_not_overflow() {
        let mut b = Backoff::new(secs(1), secs(30), false);
        for _ in 0..1000 {
            assert!(b.next_delay() <= secs(30));
        }
    }
}
