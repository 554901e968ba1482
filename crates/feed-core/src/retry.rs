use std::time::Duration;

use rand::Rng;

/// Reconnect backoff: exponential ceiling, capped, with full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    /// A cap below `base_delay_ms` is raised to it.
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    /// `base * 2^attempt`, capped. `attempt` is 0-based.
    pub fn ceiling_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }

    /// Uniform in `0..=ceiling`, raised to the server's retry hint (itself
    /// capped).
    pub fn jittered_delay_for_attempt<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        retry_after_hint_ms: Option<u64>,
        rng: &mut R,
    ) -> Duration {
        let ceiling = self.ceiling_for_attempt(attempt).as_millis() as u64;
        let floor = retry_after_hint_ms.unwrap_or(0).min(self.max_delay_ms);
        Duration::from_millis(rng.gen_range(0..=ceiling).max(floor))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1_000, 30_000)
    }
}
