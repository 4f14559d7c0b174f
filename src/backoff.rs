use std::time::Duration;

use rand::Rng as _;

/// Exponential, capped, jittered delay between reconnect attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay that is randomised, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Upper bound of the delay for a zero-based `attempt`: `min(max, base * 2^attempt)`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay for `attempt`, uniformly drawn from `[ceiling * (1 - jitter), ceiling]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || ceiling.is_zero() {
            return ceiling;
        }
        let spread: f64 = rand::rng().random_range(0.0..=jitter);
        ceiling.mul_f64(1.0 - spread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter: f64) -> Backoff {
        Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1_000),
            jitter,
        }
    }

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let b = backoff(0.0);
        let delays: Vec<u128> = (0..6).map(|a| b.delay(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        assert_eq!(backoff(0.0).ceiling(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let b = backoff(0.5);
        for attempt in 0..8 {
            let ceiling = b.ceiling(attempt);
            for _ in 0..50 {
                let delay = b.delay(attempt);
                assert!(delay <= ceiling);
                assert!(delay >= ceiling.mul_f64(0.5));
            }
        }
    }
}
