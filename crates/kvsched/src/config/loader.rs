use std::path::Path;

use crate::config::schema::SchedulerConfig;
use crate::error::ConfigError;

/// Loads and validates a scheduler config. Files ending in `.json` are
/// parsed as JSON, everything else as YAML.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SchedulerConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        let config: SchedulerConfig = serde_json::from_str(&content)?;
        validate_config(&config)?;
        Ok(config)
    } else {
        load_config_from_str(&content)
    }
}

/// Parses a YAML config. An empty document yields the defaults.
pub fn load_config_from_str(content: &str) -> Result<SchedulerConfig, ConfigError> {
    let config: SchedulerConfig = if content.trim().is_empty() {
        SchedulerConfig::default()
    } else {
        serde_yaml::from_str(content)?
    };

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.descriptor_cache_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "descriptor_cache_capacity must be greater than 0".to_string(),
        });
    }

    if config.txn_queue_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "txn_queue_capacity must be greater than 0".to_string(),
        });
    }

    if config.notification_timeout_ms == 0 {
        return Err(ConfigError::Validation {
            message: "notification_timeout_ms must be greater than 0".to_string(),
        });
    }

    if config.retry.period_ms == 0 {
        return Err(ConfigError::Validation {
            message: "retry.period_ms must be greater than 0".to_string(),
        });
    }

    Ok(())
}
