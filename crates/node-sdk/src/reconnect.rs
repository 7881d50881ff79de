//! Reconnect policy: exponential back-off with per-client jitter.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Fraction of the delay added as jitter (`0.25` = up to +25%).
    pub jitter: f64,
    /// Consecutive failures before giving up.  `0` = retry forever.
    pub max_attempts: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.25,
            max_attempts: 0,
        }
    }
}

impl ReconnectBackoff {
    /// Fixed delay, no jitter.  Handy in tests.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            jitter: 0.0,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).  `seed` spreads
    /// nodes that lost the gateway at the same moment.
    pub fn delay_for_attempt(&self, attempt: u32, seed: u64) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exp = attempt.min(32) as i32;
        let capped_ms = (base_ms * self.backoff_factor.powi(exp)).min(self.max_delay.as_millis() as f64);
        let jitter_ms = capped_ms * self.jitter.clamp(0.0, 1.0) * unit_fraction(seed, attempt);
        Duration::from_millis((capped_ms + jitter_ms) as u64)
    }

    pub fn should_give_up(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Deterministic value in `[0, 1)` derived from `seed` and `attempt`.
fn unit_fraction(seed: u64, attempt: u32) -> f64 {
    // splitmix64 finalizer
    let mut z = seed ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_until_capped() {
        let p = ReconnectBackoff {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(p.delay_for_attempt(0, 1), Duration::from_secs(1));
        assert_eq!(p.delay_for_attempt(1, 1), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(3, 1), Duration::from_secs(8));
        assert_eq!(p.delay_for_attempt(20, 1), Duration::from_secs(60));
        assert_eq!(p.delay_for_attempt(u32::MAX, 1), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let p = ReconnectBackoff::default();
        for seed in 0..50u64 {
            let d = p.delay_for_attempt(10, seed);
            assert!(d >= Duration::from_secs(60));
            assert!(d <= Duration::from_millis(75_000));
        }
    }

    #[test]
    fn different_seeds_spread_delays() {
        let p = ReconnectBackoff::default();
        let delays: std::collections::HashSet<_> =
            (0..10u64).map(|s| p.delay_for_attempt(2, s)).collect();
        assert!(delays.len() > 1);
    }

    #[test]
    fn give_up_only_when_limited() {
        let limited = ReconnectBackoff::fixed(Duration::from_millis(10), 3);
        assert!(!limited.should_give_up(2));
        assert!(limited.should_give_up(3));
        assert!(!ReconnectBackoff::default().should_give_up(1_000_000));
    }
}
