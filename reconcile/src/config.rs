//! Engine configuration, injected per coordinator

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};

/// Retry, concurrency and failure policy for reconciliation runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Retries after the first failed fetch attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles per retry
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Timeout for each external fetch call
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Store writes in flight at once
    #[serde(default = "default_apply_concurrency")]
    pub apply_concurrency: usize,
    /// Stop dispatching operations after the first failure
    #[serde(default)]
    pub abort_on_first_apply_failure: bool,
    /// Delete local records that vanished upstream
    #[serde(default = "default_allow_deletes")]
    pub allow_deletes: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            apply_concurrency: default_apply_concurrency(),
            abort_on_first_apply_failure: false,
            allow_deletes: default_allow_deletes(),
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.apply_concurrency == 0 {
            return Err(ReconcileError::InvalidConfig(
                "apply_concurrency must be at least 1".to_string(),
            ));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(ReconcileError::InvalidConfig(
                "fetch_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_backoff_ms < self.backoff_base_ms {
            return Err(ReconcileError::InvalidConfig(format!(
                "max_backoff_ms ({}) is below backoff_base_ms ({})",
                self.max_backoff_ms, self.backoff_base_ms
            )));
        }
        Ok(())
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Delay before retry number `retry` (1-based), without jitter
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

// Default value functions
fn default_max_retries() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 500 }
fn default_max_backoff_ms() -> u64 { 30_000 }
fn default_fetch_timeout_ms() -> u64 { 30_000 }
fn default_apply_concurrency() -> usize { 1 }
fn default_allow_deletes() -> bool { true }
