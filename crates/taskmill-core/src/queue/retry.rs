//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Backoff for requeued tasks.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Random spread as a fraction of the delay (0.0 disables jitter).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Requeued tasks are eligible again immediately.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    ///
    /// `base_delay * multiplier^(retry - 1)`, capped at `max_delay`, then spread by
    /// `jitter` in both directions.
    ///
    /// Example with base_delay=2s, multiplier=2.0:
    /// - retry 1: 2s
    /// - retry 2: 4s
    /// - retry 3: 8s
    pub fn next_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let spread = if self.jitter > 0.0 {
            let unit = rand::random::<f64>() * 2.0 - 1.0;
            capped * self.jitter.min(1.0) * unit
        } else {
            0.0
        };
        let secs = (capped + spread).max(0.0);
        if secs.is_finite() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = no_jitter();

        let d1 = policy.next_delay(1);
        let d2 = policy.next_delay(2);
        let d3 = policy.next_delay(3);

        assert_eq!(d1, Duration::from_secs(2));
        assert_eq!(d2, Duration::from_secs(4));
        assert_eq!(d3, Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let policy = no_jitter();
        assert_eq!(policy.next_delay(30), Duration::from_secs(300));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let d = policy.next_delay(2);
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(6));
        }
    }

    #[test]
    fn immediate_policy_has_no_delay() {
        assert_eq!(RetryPolicy::immediate().next_delay(5), Duration::ZERO);
    }
}
