//! Pipeline configuration
//!
//! Groups the tunable limits of the preview pipeline (cache sizes and
//! lifetimes, load concurrency, progress timing). Configuration can be loaded
//! from a TOML file, from environment variables, or built programmatically.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Tunable limits for every stage of the row preview pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Lifetime of a resolved preview path in the ensure cache
    pub resolved_ttl_secs: u64,
    /// Maximum number of resolved preview paths kept
    pub resolved_capacity: usize,
    /// Lifetime of a warm decode entry
    pub warm_ttl_secs: u64,
    /// Maximum number of rows remembered by the warm decode cache
    pub warm_capacity: usize,
    /// Maximum number of concurrently pending loads
    pub max_in_flight: usize,
    /// Upper bound on how long an idle callback may be deferred
    pub idle_timeout_ms: u64,
    /// Host progress reporting interval, drives the easing window
    pub progress_interval_ms: u64,
    /// Telemetry older than this stops extrapolating
    pub stale_after_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resolved_ttl_secs: 5 * 60,
            resolved_capacity: 2048,
            warm_ttl_secs: 10 * 60,
            warm_capacity: 2048,
            max_in_flight: 2,
            idle_timeout_ms: 200,
            progress_interval_ms: 250,
            stale_after_ms: 30_000,
        }
    }
}

const ENV_RESOLVED_TTL_SECS: &str = "JOBROW_RESOLVED_TTL_SECS";
const ENV_RESOLVED_CAPACITY: &str = "JOBROW_RESOLVED_CAPACITY";
const ENV_WARM_TTL_SECS: &str = "JOBROW_WARM_TTL_SECS";
const ENV_WARM_CAPACITY: &str = "JOBROW_WARM_CAPACITY";
const ENV_MAX_IN_FLIGHT: &str = "JOBROW_MAX_IN_FLIGHT";
const ENV_IDLE_TIMEOUT_MS: &str = "JOBROW_IDLE_TIMEOUT_MS";
const ENV_PROGRESS_INTERVAL_MS: &str = "JOBROW_PROGRESS_INTERVAL_MS";
const ENV_STALE_AFTER_MS: &str = "JOBROW_STALE_AFTER_MS";

/// Every environment variable read by [`PipelineConfig::from_env`]
pub const ENV_VARS: [&str; 8] = [
    ENV_RESOLVED_TTL_SECS,
    ENV_RESOLVED_CAPACITY,
    ENV_WARM_TTL_SECS,
    ENV_WARM_CAPACITY,
    ENV_MAX_IN_FLIGHT,
    ENV_IDLE_TIMEOUT_MS,
    ENV_PROGRESS_INTERVAL_MS,
    ENV_STALE_AFTER_MS,
];

impl PipelineConfig {
    pub fn with_resolved_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.resolved_capacity = capacity;
        self.resolved_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_warm_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.warm_capacity = capacity;
        self.warm_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    pub fn with_progress_interval_ms(mut self, ms: u64) -> Self {
        self.progress_interval_ms = ms;
        self
    }

    pub fn with_stale_after_ms(mut self, ms: u64) -> Self {
        self.stale_after_ms = ms;
        self
    }

    pub fn resolved_ttl(&self) -> Duration {
        Duration::from_secs(self.resolved_ttl_secs)
    }

    pub fn warm_ttl(&self) -> Duration {
        Duration::from_secs(self.warm_ttl_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Loads configuration from environment variables.
    ///
    /// Unset variables keep their defaults; see [`ENV_VARS`].
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        env_override(ENV_RESOLVED_TTL_SECS, &mut config.resolved_ttl_secs)?;
        env_override(ENV_RESOLVED_CAPACITY, &mut config.resolved_capacity)?;
        env_override(ENV_WARM_TTL_SECS, &mut config.warm_ttl_secs)?;
        env_override(ENV_WARM_CAPACITY, &mut config.warm_capacity)?;
        env_override(ENV_MAX_IN_FLIGHT, &mut config.max_in_flight)?;
        env_override(ENV_IDLE_TIMEOUT_MS, &mut config.idle_timeout_ms)?;
        env_override(ENV_PROGRESS_INTERVAL_MS, &mut config.progress_interval_ms)?;
        env_override(ENV_STALE_AFTER_MS, &mut config.stale_after_ms)?;

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format (every key optional):
    /// ```toml
    /// resolved_ttl_secs = 300
    /// resolved_capacity = 2048
    /// warm_ttl_secs = 600
    /// warm_capacity = 2048
    /// max_in_flight = 2
    /// idle_timeout_ms = 200
    /// progress_interval_ms = 250
    /// stale_after_ms = 30000
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects limits that would stall the pipeline
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero_checks = [
            ("resolved_capacity", self.resolved_capacity == 0),
            ("warm_capacity", self.warm_capacity == 0),
            ("max_in_flight", self.max_in_flight == 0),
        ];
        for (key, is_zero) in zero_checks {
            if is_zero {
                return Err(ConfigError::InvalidValue(key.to_string()));
            }
        }
        Ok(())
    }
}

fn env_override<T: std::str::FromStr>(key: &str, slot: &mut T) -> Result<(), ConfigError> {
    if let Ok(val) = std::env::var(key) {
        *slot = val
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string()))?;
    }
    Ok(())
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),

    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Could not serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
