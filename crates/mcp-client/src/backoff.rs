//! Restart delay with jittered exponential back-off.

use std::time::Duration;

/// Delay between automatic restarts of an unhealthy server.
///
/// The attempt limit is per server (`ServerConfig::max_restart_attempts`);
/// this only decides how long to wait before attempt `n`.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    /// Delay before the first restart.
    pub initial_delay: Duration,
    /// Cap on the computed delay, before jitter.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RestartBackoff {
    /// No waiting at all. Useful in tests.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }

    /// Delay before restart `attempt` (1-based) of `server_id`.
    ///
    /// Up to 25% jitter is added; the server id is mixed in so that servers
    /// failing together do not restart in lockstep.
    pub fn delay_for(&self, server_id: &str, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_factor.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let seed = server_id
            .bytes()
            .fold(attempt, |acc, b| acc.rotate_left(5) ^ u32::from(b));
        let jitter = capped_ms * 0.25 * pseudo_random_fraction(seed);
        Duration::from_millis((capped_ms + jitter) as u64)
    }
}

/// Cheap deterministic fraction in [0, 1).
fn pseudo_random_fraction(seed: u32) -> f64 {
    let hash = seed.wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64 + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempts() {
        let b = RestartBackoff::default();
        let d1 = b.delay_for("fs", 1);
        let d2 = b.delay_for("fs", 2);
        let d3 = b.delay_for("fs", 3);
        assert!(d1 >= Duration::from_secs(1));
        assert!(d2 >= Duration::from_secs(2));
        assert!(d3 >= Duration::from_secs(4));
        assert!(d1 < Duration::from_millis(1_250));
    }

    #[test]
    fn delay_capped_at_max_plus_jitter() {
        let b = RestartBackoff {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            backoff_factor: 10.0,
        };
        let d = b.delay_for("fs", 20);
        assert!(d >= Duration::from_secs(30));
        assert!(d <= Duration::from_millis(37_500));
    }

    #[test]
    fn immediate_never_waits() {
        let b = RestartBackoff::immediate();
        assert_eq!(b.delay_for("fs", 1), Duration::ZERO);
        assert_eq!(b.delay_for("fs", 7), Duration::ZERO);
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let b = RestartBackoff::default();
        assert!(b.delay_for("fs", u32::MAX) <= Duration::from_millis(37_500));
    }
}
