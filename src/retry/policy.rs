use std::time::Duration;

use rand::Rng;

/// Exponential backoff schedule for gateway reconnects.
///
/// `backoff_delay` is a pure function of the attempt number so the
/// schedule can be checked without a clock.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Reconnect attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Jitter ratio (0.0..=1.0) applied to each delay.
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    /// 1s, 2s, 4s, 8s, 16s, then give up.
    pub fn reconnect_default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.0,
        }
    }

    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`. `attempt` is 1-based.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Every delay the policy will wait, in order.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(|attempt| self.backoff_delay(attempt))
    }

    /// Scale `delay` by a random factor in `1 ± jitter_ratio`.
    pub fn with_jitter(&self, delay: Duration) -> Duration {
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - ratio..=1.0 + ratio);
        delay.mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reconnect_default()
    }
}
