use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::RetryPolicy;

pub const VERIFY_MODE_ENV: &str = "KVSCHED_VERIFY_MODE";
pub const LOG_GRAPH_WALK_ENV: &str = "KVSCHED_LOG_GRAPH_WALK";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub record_transaction_history: bool,
    #[serde(default = "default_history_age_limit")]
    pub transaction_history_age_limit_mins: u64,
    #[serde(default = "default_init_period")]
    pub permanently_recorded_init_period_mins: u64,
    #[serde(default)]
    pub enable_txn_simulation: bool,
    #[serde(default = "default_true")]
    pub print_txn_summary: bool,
    #[serde(default = "default_cache_capacity")]
    pub descriptor_cache_capacity: u64,
    #[serde(default = "default_queue_capacity")]
    pub txn_queue_capacity: usize,
    #[serde(default = "default_notification_timeout")]
    pub notification_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub verify_mode: bool,
    #[serde(default)]
    pub log_graph_walk: bool,
}

fn default_true() -> bool {
    true
}

fn default_history_age_limit() -> u64 {
    24 * 60
}

fn default_init_period() -> u64 {
    60
}

fn default_cache_capacity() -> u64 {
    500
}

fn default_queue_capacity() -> usize {
    100
}

fn default_notification_timeout() -> u64 {
    2000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            record_transaction_history: true,
            transaction_history_age_limit_mins: default_history_age_limit(),
            permanently_recorded_init_period_mins: default_init_period(),
            enable_txn_simulation: false,
            print_txn_summary: true,
            descriptor_cache_capacity: default_cache_capacity(),
            txn_queue_capacity: default_queue_capacity(),
            notification_timeout_ms: default_notification_timeout(),
            retry: RetryConfig::default(),
            verify_mode: false,
            log_graph_walk: false,
        }
    }
}

impl SchedulerConfig {
    /// Turns on verify mode and graph-walk logging when the corresponding
    /// environment variables are set to a non-empty value.
    pub fn apply_env_overrides(&mut self) {
        if env_flag(VERIFY_MODE_ENV) {
            self.verify_mode = true;
        }
        if env_flag(LOG_GRAPH_WALK_ENV) {
            self.log_graph_walk = true;
        }
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false)
}

/// Default retry policy for transactions that opt into retries without
/// giving their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_period")]
    pub period_ms: u64,
    /// Retries after the first failure; 0 means unlimited.
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_true")]
    pub exp_backoff: bool,
}

fn default_retry_period() -> u64 {
    1000
}

fn default_retry_max_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            period_ms: default_retry_period(),
            max_attempts: default_retry_max_attempts(),
            exp_backoff: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            period: Duration::from_millis(self.period_ms),
            max_attempts: self.max_attempts,
            exp_backoff: self.exp_backoff,
        }
    }
}
