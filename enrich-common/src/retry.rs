use std::time::Duration;

/// The retry policy applied when the provider answers 429.
///
/// Backoff grows linearly: `base + attempt * step`. Exhausting the budget
/// classifies the item as a transient Error, never as Invalid, since the
/// provider accepting requests again is only a matter of time.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_base: Duration,
    backoff_step: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration, backoff_step: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
            backoff_step,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Time to wait before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base + self.backoff_step * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_secs(15),
            backoff_step: Duration::from_secs(5),
        }
    }
}
