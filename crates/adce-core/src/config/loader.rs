//! Configuration loading and validation

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use super::types::EngineConfig;

/// ConfigurationError: the only error class that is fatal (at startup).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Load and validate a TOML config file.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    info!(path = %path.display(), "loading config");
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    debug!(path = %path.display(), sources = config.sources.len(), "config loaded and validated");
    Ok(config)
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    validate_reconcile(config)?;
    validate_executor(config)?;
    validate_retry(config)?;
    validate_priority(config)?;
    validate_monitor(config)?;
    validate_sources(config)?;
    Ok(())
}

fn validate_reconcile(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.reconcile.interval_secs == 0 {
        return Err(ConfigError::invalid("reconcile.interval_secs", "must be > 0"));
    }
    if config.reconcile.lookback_days == 0 {
        return Err(ConfigError::invalid("reconcile.lookback_days", "must be > 0"));
    }
    if config.reconcile.staleness_secs == 0 {
        return Err(ConfigError::invalid("reconcile.staleness_secs", "must be > 0"));
    }
    Ok(())
}

fn validate_executor(config: &EngineConfig) -> Result<(), ConfigError> {
    let ex = &config.executor;
    if ex.workers == 0 {
        return Err(ConfigError::invalid("executor.workers", "must be at least 1"));
    }
    if ex.poll_interval_ms == 0 {
        return Err(ConfigError::invalid("executor.poll_interval_ms", "must be > 0"));
    }
    if ex.fetch_timeout_secs == 0 {
        return Err(ConfigError::invalid("executor.fetch_timeout_secs", "must be > 0"));
    }
    Ok(())
}

fn validate_retry(config: &EngineConfig) -> Result<(), ConfigError> {
    let retry = &config.retry;
    if retry.max_attempts == 0 {
        return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
    }
    if retry.backoff_base_ms == 0 {
        return Err(ConfigError::invalid("retry.backoff_base_ms", "must be > 0"));
    }
    if retry.backoff_cap_ms < retry.backoff_base_ms {
        return Err(ConfigError::invalid(
            "retry.backoff_cap_ms",
            "must be >= retry.backoff_base_ms",
        ));
    }
    if !(0.0..=1.0).contains(&retry.score_decay) {
        return Err(ConfigError::invalid("retry.score_decay", "must be within 0.0..=1.0"));
    }
    Ok(())
}

fn validate_priority(config: &EngineConfig) -> Result<(), ConfigError> {
    let p = &config.priority;
    if !(p.critical_within_hours <= p.high_within_hours
        && p.high_within_hours <= p.medium_within_hours)
    {
        return Err(ConfigError::invalid(
            "priority",
            "thresholds must satisfy critical <= high <= medium",
        ));
    }
    Ok(())
}

fn validate_monitor(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.monitor.listen.parse::<SocketAddr>().is_err() {
        return Err(ConfigError::invalid(
            "monitor.listen",
            format!("not a socket address: {}", config.monitor.listen),
        ));
    }
    if config.monitor.recent_capacity == 0 {
        return Err(ConfigError::invalid("monitor.recent_capacity", "must be at least 1"));
    }
    Ok(())
}

fn validate_sources(config: &EngineConfig) -> Result<(), ConfigError> {
    for (name, source) in &config.sources {
        if name.trim().is_empty() {
            return Err(ConfigError::invalid("sources", "source name cannot be empty"));
        }
        if !source.rate_per_second.is_finite() || source.rate_per_second < 0.0 {
            return Err(ConfigError::invalid(
                format!("sources.{name}.rate_per_second"),
                "must be a finite number >= 0",
            ));
        }
        if source.rate_per_second > 0.0 && source.burst == 0 {
            return Err(ConfigError::invalid(
                format!("sources.{name}.burst"),
                "must be at least 1 when rate limiting is enabled",
            ));
        }
        if let Some(template) = &source.url_template
            && !template.contains("{entity}")
        {
            return Err(ConfigError::invalid(
                format!("sources.{name}.url_template"),
                "must contain {entity} placeholder",
            ));
        }
    }
    Ok(())
}
