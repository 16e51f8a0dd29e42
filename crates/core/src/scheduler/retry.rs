//! Retry policy for failed executions.

/// What to do after a failed execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to `pending` and re-enqueue it immediately.
    Retry,
    /// Mark the job `failed`.
    GiveUp,
}

/// Allows up to `max_retries` re-executions after the first failure, so a
/// job runs at most `max_retries + 1` times. There is no backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// `failed_attempts` counts the attempt that just failed.
    pub fn decide(&self, failed_attempts: u32) -> RetryDecision {
        if failed_attempts <= self.max_retries {
            RetryDecision::Retry
        } else {
            RetryDecision::GiveUp
        }
    }
}
