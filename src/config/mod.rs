//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The API token is wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub api_url: String,
    pub api_token: SecretString,
    pub store_dir: PathBuf,
    pub engine: EngineConfig,
    pub sync_interval: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Knobs for the sync engine's retry policy.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Failed attempts after which a transiently failing mutation is parked.
    pub max_attempts: u32,
    /// Upper bound on a single remote apply.
    pub apply_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            apply_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = EngineConfig::default();
        Ok(Self {
            api_url: required_var("FIELDSYNC_API_URL")?,
            api_token: SecretString::from(required_var("FIELDSYNC_API_TOKEN")?),
            store_dir: std::env::var("FIELDSYNC_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".fieldsync")),
            engine: EngineConfig {
                max_attempts: nonzero_var("FIELDSYNC_MAX_ATTEMPTS", defaults.max_attempts)?,
                apply_timeout: Duration::from_secs(nonzero_var(
                    "FIELDSYNC_APPLY_TIMEOUT_SECS",
                    defaults.apply_timeout.as_secs(),
                )?),
            },
            sync_interval: Duration::from_secs(nonzero_var("FIELDSYNC_SYNC_INTERVAL_SECS", 60)?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

/// Like `parsed_var`, but zero is rejected.
fn nonzero_var<T: FromStr + Default + PartialEq>(name: &str, default: T) -> Result<T> {
    let value = parsed_var(name, default)?;
    if value == T::default() {
        return Err(Error::Config(format!("{name} must be greater than zero")));
    }
    Ok(value)
}
