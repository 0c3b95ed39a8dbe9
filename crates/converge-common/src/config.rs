//! Reconciler configuration.
//!
//! ```yaml
//! retry:
//!   max_attempts: 5
//!   base_delay_ms: 500
//!   strategy: exponential
//! timeouts:
//!   create_secs: 600
//!   update_secs: 600
//!   delete_secs: 600
//! max_transient_probe_errors: 20
//! kinds:
//!   job_queue:
//!     delete_secs: 1200
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::{BackoffStrategy, RetryPolicy};
use crate::error::ConfigError;

/// Default per-operation timeout (10 minutes).
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Time budgets for each operation kind of one resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTimeouts {
    /// Budget for create, including the readiness wait.
    pub create: Duration,
    /// Budget for update, shared by all mutation groups.
    pub update: Duration,
    /// Budget for delete, shared by the drain and delete steps.
    pub delete: Duration,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            create: DEFAULT_OPERATION_TIMEOUT,
            update: DEFAULT_OPERATION_TIMEOUT,
            delete: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

/// Retry settings for transient mutation and read errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Total attempts per mutation, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Delay growth.
    pub strategy: BackoffStrategy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Timeout overrides in seconds; unset fields fall back to the next level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutSettings {
    /// Create budget.
    pub create_secs: Option<u64>,
    /// Update budget.
    pub update_secs: Option<u64>,
    /// Delete budget.
    pub delete_secs: Option<u64>,
}

impl TimeoutSettings {
    fn apply(&self, base: OperationTimeouts) -> OperationTimeouts {
        OperationTimeouts {
            create: self.create_secs.map(Duration::from_secs).unwrap_or(base.create),
            update: self.update_secs.map(Duration::from_secs).unwrap_or(base.update),
            delete: self.delete_secs.map(Duration::from_secs).unwrap_or(base.delete),
        }
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        for (name, value) in [
            ("create_secs", self.create_secs),
            ("update_secs", self.update_secs),
            ("delete_secs", self.delete_secs),
        ] {
            if value == Some(0) {
                return Err(ConfigError::invalid(
                    format!("{field}.{name}"),
                    "timeout must be positive",
                ));
            }
        }
        Ok(())
    }
}

/// Top-level reconciler configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerConfig {
    /// Mutation retry settings.
    pub retry: RetrySettings,
    /// Default timeouts for every kind.
    pub timeouts: TimeoutSettings,
    /// Ceiling on consecutive transient probe errors per wait; unset means
    /// only the timeout bounds them.
    pub max_transient_probe_errors: Option<u32>,
    /// Per-kind timeout overrides.
    pub kinds: BTreeMap<String, TimeoutSettings>,
}

impl ReconcilerConfig {
    /// Loads and validates configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parses and validates configuration from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ReconcilerConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                "must be at least 1",
            ));
        }
        self.timeouts.validate("timeouts")?;
        for (kind, settings) in &self.kinds {
            settings.validate(&format!("kinds.{kind}"))?;
        }
        Ok(())
    }

    /// The mutation retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            self.retry.strategy,
            Duration::from_millis(self.retry.base_delay_ms),
        )
    }

    /// Effective timeouts for `kind`, layering kind overrides over global
    /// settings over `base`.
    pub fn timeouts_for(&self, kind: &str, base: OperationTimeouts) -> OperationTimeouts {
        let global = self.timeouts.apply(base);
        match self.kinds.get(kind) {
            Some(overrides) => overrides.apply(global),
            None => global,
        }
    }
}
