//! Fixed-interval retry policy
//!
//! Used by the lease lock campaign and by watch reconnects. Both loops are
//! unbounded unless a maximum attempt count or a deadline is configured.

use std::time::Duration;

/// Fixed-interval retry with optional bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep between two attempts
    pub interval: Duration,
    /// Give up after this many failed attempts
    pub max_attempts: Option<u64>,
    /// Give up once this much time has passed since the first attempt
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    /// Retry forever with the given interval.
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            deadline: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u64) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Whether another attempt is allowed after `attempts` failures and
    /// `elapsed` time since the first one.
    pub fn exhausted(&self, attempts: u64, elapsed: Duration) -> bool {
        if let Some(max) = self.max_attempts
            && attempts >= max
        {
            return true;
        }
        matches!(self.deadline, Some(deadline) if elapsed >= deadline)
    }

    pub fn is_bounded(&self) -> bool {
        self.max_attempts.is_some() || self.deadline.is_some()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(Duration::from_secs(1))
    }
}
