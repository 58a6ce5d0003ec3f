//! Hierarchical configuration loader.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::EngineConfig;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid rebalance interval: {0}. Must be at least 1 second")]
    InvalidRebalanceInterval(u64),

    #[error("Invalid min_share: {0}. Must be in [0, 0.5]")]
    InvalidMinShare(f64),

    #[error("Invalid pressure thresholds: low {0} must be below high {1}, both in (0, 2]")]
    InvalidPressureThresholds(f64, f64),

    #[error("Invalid max_shift_fraction: {0}. Must be in (0, 1]")]
    InvalidMaxShift(f64),

    #[error("Invalid max_phase_attempts: {0}. Cannot be 0")]
    InvalidMaxAttempts(u32),

    #[error("Invalid heartbeat configuration: interval {0}s with limit {1}")]
    InvalidHeartbeat(u64, u32),

    #[error("Invalid ring capacity: {0}. Must be at least 16")]
    InvalidRingCapacity(usize),

    #[error("Global cpu total must be positive, got {0}")]
    InvalidCpuTotal(f64),
}

/// Loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .foreman/config.yaml (project config)
    /// 3. .foreman/local.yaml (local overrides, optional)
    /// 4. Environment variables (FOREMAN_* prefix, highest priority)
    pub fn load() -> Result<EngineConfig> {
        let config: EngineConfig = Figment::new()
            .merge(Serialized::defaults(EngineConfig::default()))
            .merge(Yaml::file(".foreman/config.yaml"))
            .merge(Yaml::file(".foreman/local.yaml"))
            .merge(Env::prefixed("FOREMAN_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<EngineConfig> {
        let config: EngineConfig = Figment::new()
            .merge(Serialized::defaults(EngineConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &EngineConfig) -> Result<(), ConfigLoadError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigLoadError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigLoadError::InvalidLogFormat(config.logging.format.clone()));
        }

        let scheduler = &config.scheduler;
        if scheduler.rebalance_interval_secs == 0 {
            return Err(ConfigLoadError::InvalidRebalanceInterval(
                scheduler.rebalance_interval_secs,
            ));
        }
        if !(0.0..=0.5).contains(&scheduler.min_share) {
            return Err(ConfigLoadError::InvalidMinShare(scheduler.min_share));
        }
        if scheduler.low_pressure_threshold >= scheduler.high_pressure_threshold
            || scheduler.low_pressure_threshold <= 0.0
            || scheduler.high_pressure_threshold > 2.0
        {
            return Err(ConfigLoadError::InvalidPressureThresholds(
                scheduler.low_pressure_threshold,
                scheduler.high_pressure_threshold,
            ));
        }
        if !(0.0..=1.0).contains(&scheduler.max_shift_fraction)
            || scheduler.max_shift_fraction == 0.0
        {
            return Err(ConfigLoadError::InvalidMaxShift(scheduler.max_shift_fraction));
        }

        let supervision = &config.supervision;
        if supervision.max_phase_attempts == 0 {
            return Err(ConfigLoadError::InvalidMaxAttempts(supervision.max_phase_attempts));
        }
        if supervision.heartbeat_interval_secs == 0 || supervision.missed_heartbeat_limit == 0 {
            return Err(ConfigLoadError::InvalidHeartbeat(
                supervision.heartbeat_interval_secs,
                supervision.missed_heartbeat_limit,
            ));
        }

        if config.events.ring_capacity < 16 {
            return Err(ConfigLoadError::InvalidRingCapacity(config.events.ring_capacity));
        }
        if config.resources.cpu_total <= 0.0 {
            return Err(ConfigLoadError::InvalidCpuTotal(config.resources.cpu_total));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        ConfigLoader::validate(&config).expect("default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
scheduler:
  strategy: equal
  rebalance_interval_secs: 60
logging:
  level: debug
  format: pretty
";
        let config: EngineConfig = serde_yaml::from_str(yaml).expect("YAML should parse");
        assert_eq!(config.scheduler.rebalance_interval_secs, 60);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.scheduler.min_share, 0.05, "untouched fields keep defaults");
        ConfigLoader::validate(&config).expect("parsed config should be valid");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = EngineConfig::default();
        config.logging.level = "noisy".to_string();
        let result = ConfigLoader::validate(&config);
        assert!(matches!(result.unwrap_err(), ConfigLoadError::InvalidLogLevel(_)));
    }

    #[test]
    fn test_invalid_pressure_thresholds() {
        let mut config = EngineConfig::default();
        config.scheduler.low_pressure_threshold = 0.9;
        config.scheduler.high_pressure_threshold = 0.5;
        let result = ConfigLoader::validate(&config);
        assert!(matches!(result.unwrap_err(), ConfigLoadError::InvalidPressureThresholds(..)));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = EngineConfig::default();
        config.supervision.max_phase_attempts = 0;
        let result = ConfigLoader::validate(&config);
        assert!(matches!(result.unwrap_err(), ConfigLoadError::InvalidMaxAttempts(0)));
    }

    #[test]
    fn test_hierarchical_merging() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut base = NamedTempFile::new().unwrap();
        writeln!(base, "scheduler:\n  rebalance_interval_secs: 120\n  min_share: 0.1").unwrap();
        base.flush().unwrap();

        let mut overlay = NamedTempFile::new().unwrap();
        writeln!(overlay, "scheduler:\n  rebalance_interval_secs: 30").unwrap();
        overlay.flush().unwrap();

        let config: EngineConfig = Figment::new()
            .merge(Serialized::defaults(EngineConfig::default()))
            .merge(Yaml::file(base.path()))
            .merge(Yaml::file(overlay.path()))
            .extract()
            .unwrap();

        assert_eq!(config.scheduler.rebalance_interval_secs, 30, "override should win");
        assert!((config.scheduler.min_share - 0.1).abs() < f64::EPSILON, "base should persist");
    }
}
