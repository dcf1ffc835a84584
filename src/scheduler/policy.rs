use crate::core::{KernelError, Result};
use serde::{Deserialize, Serialize};

/// Longest accepted `retry_delay_seconds`: one year.
pub const MAX_RETRY_DELAY_SECONDS: u64 = 365 * 24 * 60 * 60;

/// How the scheduler treats a task whose payload keeps failing.
///
/// The default retries forever on the task's next natural interval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Mark the task `failed` after this many failures in a row.
    pub max_consecutive_failures: Option<u32>,
    /// Run again this soon after a failure instead of waiting a full
    /// interval. Also lets a one-shot task retry instead of failing.
    pub retry_delay_seconds: Option<u64>,
}

impl RetryPolicy {
    pub fn max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = Some(failures);
        self
    }

    pub fn retry_delay_seconds(mut self, seconds: u64) -> Self {
        self.retry_delay_seconds = Some(seconds);
        self
    }

    /// Whether `consecutive_failures` failures in a row exhaust the policy.
    pub fn is_exhausted(&self, consecutive_failures: u32) -> bool {
        self.max_consecutive_failures
            .map(|limit| consecutive_failures >= limit)
            .unwrap_or(false)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(delay) = self.retry_delay_seconds
            && !(1..=MAX_RETRY_DELAY_SECONDS).contains(&delay)
        {
            return Err(KernelError::InvalidArgument(format!(
                "retry.retry_delay_seconds must be between 1 and {}, got {}",
                MAX_RETRY_DELAY_SECONDS, delay
            )));
        }
        Ok(())
    }
}
