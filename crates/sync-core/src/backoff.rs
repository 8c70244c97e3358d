use std::time::Duration;

// Shift width clamp; a base delay doubled this often is far past any
// sane ceiling already.
const MAX_EXPONENT: u32 = 20;

/// Exponential reconnect delay schedule with a hard ceiling.
///
/// Attempt `n` waits `base * 2^n` milliseconds, never longer than the
/// ceiling. A server-supplied retry-after hint acts as a floor so the
/// engine never knocks earlier than the remote asked it to.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let scheduled = self
            .base_delay_ms
            .saturating_mul(1_u64 << attempt.min(MAX_EXPONENT));
        let floor = retry_after_hint_ms.unwrap_or(0);
        Duration::from_millis(scheduled.max(floor).min(self.max_delay_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(1_000, 30_000)
    }
}
