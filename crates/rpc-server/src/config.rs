//! Environment-driven server configuration

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const KEYSTORE_VAR: &str = "SITEBUNDLE_KEYSTORE";
pub const WORKERS_VAR: &str = "SITEBUNDLE_WORKERS";
pub const TIMEOUT_VAR: &str = "SITEBUNDLE_REQUEST_TIMEOUT_SECS";

const DEFAULT_KEYSTORE: &str = "./keys";
const DEFAULT_WORKERS: usize = 1;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got '{value}'")]
    NotPositive { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub keystore_dir: PathBuf,
    pub workers: usize,
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keystore_dir: PathBuf::from(DEFAULT_KEYSTORE),
            workers: DEFAULT_WORKERS,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset or empty variables keep defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get(KEYSTORE_VAR) {
            config.keystore_dir = PathBuf::from(dir);
        }
        if let Some(value) = get(WORKERS_VAR) {
            config.workers = positive(WORKERS_VAR, &value)? as usize;
        }
        if let Some(value) = get(TIMEOUT_VAR) {
            config.request_timeout = Duration::from_secs(positive(TIMEOUT_VAR, &value)?);
        }
        Ok(config)
    }
}

fn positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::NotPositive {
            var,
            value: value.to_string(),
        }),
    }
}
