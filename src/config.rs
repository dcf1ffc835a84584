use crate::codex::ExecutionBudget;
use crate::core::{KernelError, KindRegistry, Result};
use crate::scheduler::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Kernel configuration
///
/// Every field has a default, so a JSON document only needs the keys it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Known entity kinds
    pub kinds: KindRegistry,

    /// Limits applied to every codex run
    pub budget: ExecutionBudget,

    /// What the scheduler does with failing tasks
    pub retry: RetryPolicy,

    /// Page size used when a listing asks for 0
    pub default_page_size: usize,

    /// Upper bound on any requested page size
    pub max_page_size: usize,

    /// Log limit used when a caller asks for 0
    pub default_log_limit: usize,

    /// Hook executions kept in memory
    pub hook_journal_capacity: usize,

    /// Period of the optional async tick driver
    pub tick_interval_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            kinds: KindRegistry::governance_defaults(),
            budget: ExecutionBudget::default(),
            retry: RetryPolicy::default(),
            default_page_size: 20,
            max_page_size: 500,
            default_log_limit: 50,
            hook_journal_capacity: 1024,
            tick_interval_ms: 1000,
        }
    }
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the kind registry
    pub fn kinds(mut self, kinds: KindRegistry) -> Self {
        self.kinds = kinds;
        self
    }

    /// Set the codex execution budget
    pub fn budget(mut self, budget: ExecutionBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn default_page_size(mut self, size: usize) -> Self {
        self.default_page_size = size;
        self
    }

    pub fn max_page_size(mut self, size: usize) -> Self {
        self.max_page_size = size;
        self
    }

    pub fn default_log_limit(mut self, limit: usize) -> Self {
        self.default_log_limit = limit;
        self
    }

    pub fn hook_journal_capacity(mut self, capacity: usize) -> Self {
        self.hook_journal_capacity = capacity;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn tick_interval_duration(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Parse from a JSON document
    ///
    /// ```
    /// use ggg_kernel::KernelConfig;
    ///
    /// let config = KernelConfig::from_json_str(r#"{"default_page_size": 10}"#).unwrap();
    /// assert_eq!(config.default_page_size, 10);
    /// assert_eq!(config.max_page_size, 500);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_page_size == 0 || self.max_page_size == 0 {
            return Err(KernelError::InvalidArgument(
                "page sizes must be at least 1".to_string(),
            ));
        }
        if self.default_page_size > self.max_page_size {
            return Err(KernelError::InvalidArgument(format!(
                "default_page_size {} exceeds max_page_size {}",
                self.default_page_size, self.max_page_size
            )));
        }
        if self.budget.max_steps == 0 {
            return Err(KernelError::InvalidArgument(
                "budget.max_steps must be at least 1".to_string(),
            ));
        }
        self.retry.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = KernelConfig::default();
        assert_eq!(config.budget.max_steps, 10_000);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.kinds.is_publicly_readable("user"));
        assert_eq!(config.tick_interval_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_builder() {
        let config = KernelConfig::new()
            .default_page_size(5)
            .retry(RetryPolicy::default().max_consecutive_failures(3))
            .tick_interval(Duration::from_millis(250));
        assert_eq!(config.default_page_size, 5);
        assert_eq!(config.retry.max_consecutive_failures, Some(3));
        assert_eq!(config.tick_interval_ms, 250);
    }

    #[test]
    fn test_from_json() {
        let config = KernelConfig::from_json_str(
            r#"{"budget": {"max_steps": 50}, "retry": {"retry_delay_seconds": 30}}"#,
        )
        .unwrap();
        assert_eq!(config.budget.max_steps, 50);
        assert_eq!(config.budget.max_duration_ms, 250);
        assert_eq!(config.retry.retry_delay_seconds, Some(30));

        assert!(KernelConfig::from_json_str(r#"{"max_page_size": 0}"#).is_err());
        for delay in ["0", "18446744073709551615"] {
            let json = format!(r#"{{"retry": {{"retry_delay_seconds": {}}}}}"#, delay);
            assert!(matches!(
                KernelConfig::from_json_str(&json),
                Err(KernelError::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            KernelConfig::from_json_str("{"),
            Err(KernelError::SerializationError(_))
        ));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"hook_journal_capacity": 8}}"#).unwrap();
        let config = KernelConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.hook_journal_capacity, 8);

        assert!(matches!(
            KernelConfig::from_json_file("/nonexistent/ggg.json"),
            Err(KernelError::IoError(_))
        ));
    }
}
