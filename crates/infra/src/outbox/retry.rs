//! Backoff for outbox rows whose enqueue failed transiently.
//!
//! Delays double per failed attempt up to a cap. Each row then gets its own
//! offset inside the jitter window, derived from its outbox id, so rows that
//! failed together during one outage do not come due at the same instant.

use std::time::Duration;

use conduit_core::OutboxId;

/// How many times, and how far apart, an outbox row is retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts after which a row is abandoned.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Share of the delay (0.0-1.0) shaved off by the per-row offset.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    /// Same delay after every failure, no spread.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.2,
        }
    }

    /// Whether a row that has failed `attempts_made` times gets another try.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before row `outbox_id` is due again after failure number `attempt`.
    ///
    /// Stable for a given row and attempt; never above `max_delay`.
    pub fn delay_for(&self, outbox_id: OutboxId, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let doublings = attempt.saturating_sub(1).min(31);
        let ceiling = self
            .base_delay
            .checked_mul(1u32 << doublings)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return ceiling;
        }
        let window = ceiling.mul_f64(jitter);
        ceiling - window.mul_f64(spread(outbox_id, attempt))
    }
}

/// Position in `[0, 1)` for a row and attempt.
fn spread(outbox_id: OutboxId, attempt: u32) -> f64 {
    let bits = outbox_id.as_uuid().as_u128();
    let folded = (bits as u64) ^ ((bits >> 64) as u64) ^ u64::from(attempt);
    (mix(folded) >> 11) as f64 / (1u64 << 53) as f64
}

/// splitmix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn delays_double_until_the_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(1))
        };
        let row = OutboxId::new();

        assert_eq!(policy.delay_for(row, 0), Duration::ZERO);
        assert_eq!(policy.delay_for(row, 1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(row, 2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(row, 4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(row, 5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(row, 500), Duration::from_secs(1));
    }

    #[test]
    fn rows_failing_together_are_spread_apart() {
        let policy = RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(60));
        let delays: HashSet<Duration> = (0..32)
            .map(|_| policy.delay_for(OutboxId::new(), 3))
            .collect();
        assert!(delays.len() > 1);

        let window_floor = Duration::from_secs(4).mul_f64(1.0 - policy.jitter);
        assert!(delays
            .iter()
            .all(|d| *d <= Duration::from_secs(4) && *d >= window_floor));
    }

    #[test]
    fn a_row_keeps_its_delay_for_an_attempt() {
        let policy = RetryPolicy::default();
        let row = OutboxId::new();
        assert_eq!(policy.delay_for(row, 2), policy.delay_for(row, 2));
        for attempt in 1..40 {
            assert!(policy.delay_for(row, attempt) <= policy.max_delay);
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.delay_for(OutboxId::new(), 2), Duration::from_millis(10));
    }
}
