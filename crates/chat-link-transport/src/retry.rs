//! Retry policy for the stream transport's fallback path.

use std::time::Duration;

/// Base delay for exponential backoff.
const BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Maximum backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How many automatic re-connection attempts a transport may make, and how
/// long to wait before each.
///
/// The policy is owned by the single task driving a connection, so at most
/// one retry is ever scheduled at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum automatic attempts after the initial one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
    /// Cap on the delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single_fallback()
    }
}

impl RetryPolicy {
    /// One fallback attempt.
    #[must_use]
    pub const fn single_fallback() -> Self {
        Self {
            max_attempts: 1,
            base_delay: BASE_BACKOFF,
            max_delay: MAX_BACKOFF,
        }
    }

    /// Never retry automatically.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Override the base delay.
    #[must_use]
    pub const fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// budget is spent.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow((attempt - 1).min(10));
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}
