//! Configuration loading helpers.
//!
//! Settings come from an optional TOML file plus `PMFREQ__section__field`
//! environment overrides:
//!
//! ```toml
//! [pool]
//! size = 268435456
//! lanes = 64
//! lane_log_size = 4096
//! flush = true
//! layout = "freq"
//!
//! [log]
//! filter = "pmfreq=info"
//! ```

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::constants::LAYOUT;
use crate::pool::PoolConfig;

const ENV_CONFIG: &str = "PMFREQ_CONFIG";
const ENV_PREFIX: &str = "PMFREQ__";
const DEFAULT_LOG_FILTER: &str = "info";

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PmfreqConfig {
    /// Pool configuration.
    pub pool: Option<PoolConfigSpec>,
    /// Logging configuration.
    pub log: Option<LogConfigSpec>,
}

impl PmfreqConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `PMFREQ_CONFIG` env var (if set),
    /// then apply `PMFREQ__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var(ENV_CONFIG).ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load `path` if given, else `PMFREQ_CONFIG`, then apply overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let mut config = Self::load_from_path(path)?;
                config.apply_env_overrides()?;
                Ok(config)
            }
            None => Self::load_from_env(),
        }
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(env::vars())
    }

    fn apply_overrides(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path = rest.to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["pool", "size"] => {
                    self.pool_mut().size = Some(parse_value(&key, &value)?);
                }
                ["pool", "lanes"] => {
                    self.pool_mut().lanes = Some(parse_value(&key, &value)?);
                }
                ["pool", "lane_log_size"] => {
                    self.pool_mut().lane_log_size = Some(parse_value(&key, &value)?);
                }
                ["pool", "flush"] => {
                    self.pool_mut().flush = Some(parse_value(&key, &value)?);
                }
                ["pool", "layout"] => {
                    self.pool_mut().layout = Some(value);
                }
                ["log", "filter"] => {
                    self.log_mut().filter = Some(value);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build a `PoolConfig` using defaults plus overrides.
    pub fn to_pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::default();
        if let Some(pool) = &self.pool {
            pool.apply_to(&mut config);
        }
        config
    }

    /// Layout name to create and open pools with.
    pub fn layout(&self) -> &str {
        self.pool
            .as_ref()
            .and_then(|pool| pool.layout.as_deref())
            .unwrap_or(LAYOUT)
    }

    /// `tracing-subscriber` filter directive.
    pub fn log_filter(&self) -> &str {
        self.log
            .as_ref()
            .and_then(|log| log.filter.as_deref())
            .unwrap_or(DEFAULT_LOG_FILTER)
    }

    fn pool_mut(&mut self) -> &mut PoolConfigSpec {
        self.pool.get_or_insert_with(PoolConfigSpec::default)
    }

    fn log_mut(&mut self) -> &mut LogConfigSpec {
        self.log.get_or_insert_with(LogConfigSpec::default)
    }
}

/// Pool configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfigSpec {
    /// Pool file size in bytes.
    pub size: Option<u64>,
    /// Number of undo-log lanes.
    pub lanes: Option<usize>,
    /// Bytes per undo-log lane.
    pub lane_log_size: Option<u64>,
    /// Flush commits to the backing file.
    pub flush: Option<bool>,
    /// Pool layout name.
    pub layout: Option<String>,
}

impl PoolConfigSpec {
    fn apply_to(&self, config: &mut PoolConfig) {
        if let Some(value) = self.size {
            config.size = value;
        }
        if let Some(value) = self.lanes {
            config.lanes = value.max(1);
        }
        if let Some(value) = self.lane_log_size {
            config.lane_log_size = value;
        }
        if let Some(value) = self.flush {
            config.flush = value;
        }
    }
}

/// Logging configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfigSpec {
    /// Filter directive, e.g. `pmfreq=debug`.
    pub filter: Option<String>,
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
