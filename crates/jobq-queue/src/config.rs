//! Runtime configuration
//!
//! Every setting has a default and can be overridden from the environment.

use std::env;
use std::time::Duration;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Engine and listing settings
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// How long a claimed job stays invisible to other `run` calls
    /// (env: JOBQ_LEASE_SECS)
    pub lease_duration: Duration,
    /// Upper bound on one script execution (env: JOBQ_EXECUTION_TIMEOUT_SECS)
    pub execution_timeout: Duration,
    /// Upper bound on one notification delivery (env: JOBQ_NOTIFY_TIMEOUT_MS)
    pub notify_timeout: Duration,
    /// Status code recorded when the executor raised instead of returning
    /// (env: JOBQ_FAILURE_STATUS_CODE)
    pub failure_status_code: i32,
    /// Page size when a listing gives no limit (env: JOBQ_DEFAULT_PAGE_LIMIT)
    pub default_page_limit: u32,
    /// Largest page size a listing may ask for (env: JOBQ_MAX_PAGE_LIMIT)
    pub max_page_limit: u32,
    /// Largest number of jobs accepted by one push (env: JOBQ_MAX_PUSH_BATCH)
    pub max_push_batch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            execution_timeout: Duration::from_secs(30),
            notify_timeout: Duration::from_millis(3000),
            failure_status_code: 500,
            default_page_limit: 30,
            max_page_limit: 1000,
            max_push_batch: 10,
        }
    }
}

fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl EngineConfig {
    /// Load from environment; unset or unparsable values keep their default.
    /// The combined settings must pass [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            lease_duration: parsed("JOBQ_LEASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_duration),
            execution_timeout: parsed("JOBQ_EXECUTION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.execution_timeout),
            notify_timeout: parsed("JOBQ_NOTIFY_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.notify_timeout),
            failure_status_code: parsed("JOBQ_FAILURE_STATUS_CODE")
                .unwrap_or(defaults.failure_status_code),
            default_page_limit: parsed("JOBQ_DEFAULT_PAGE_LIMIT")
                .unwrap_or(defaults.default_page_limit),
            max_page_limit: parsed("JOBQ_MAX_PAGE_LIMIT").unwrap_or(defaults.max_page_limit),
            max_push_batch: parsed("JOBQ_MAX_PUSH_BATCH").unwrap_or(defaults.max_push_batch),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_duration <= self.execution_timeout {
            return Err(ConfigError::Invalid(
                "lease duration must exceed the execution timeout".into(),
            ));
        }
        if self.default_page_limit == 0 || self.default_page_limit > self.max_page_limit {
            return Err(ConfigError::Invalid(format!(
                "default page limit {} outside 1..={}",
                self.default_page_limit, self.max_page_limit
            )));
        }
        if self.max_push_batch == 0 {
            return Err(ConfigError::Invalid("push batch limit must be positive".into()));
        }
        if (200..300).contains(&self.failure_status_code) {
            return Err(ConfigError::Invalid(
                "failure status code must not be a success code".into(),
            ));
        }
        Ok(())
    }
}
