//! Engine configuration parsing.
//!
//! The surrounding system (process bootstrap, out of scope here) loads one
//! TOML file and hands the parsed [`EngineConfig`] to whatever wires the
//! ledger, adapter, and engine together.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration loading.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML did not parse.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The parsed values are inconsistent.
    #[error("invalid config: {0}")]
    Validation(String),
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/pinegate.db")
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("data/cookies.json")
}

fn default_horizon_days() -> u32 {
    crate::report::DEFAULT_HORIZON_DAYS
}

fn default_top_assets() -> u32 {
    crate::report::DEFAULT_TOP_ASSETS
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path of the SQLite ledger database.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Path of the session-credential JSON file.
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,

    /// Dashboard expiring-soon horizon in days.
    #[serde(default = "default_horizon_days")]
    pub expiring_horizon_days: u32,

    /// Number of top assets on the dashboard.
    #[serde(default = "default_top_assets")]
    pub top_assets_limit: u32,

    /// Remote service base URL override; `None` uses the public endpoints.
    #[serde(default)]
    pub remote_base_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            credentials_path: default_credentials_path(),
            expiring_horizon_days: default_horizon_days(),
            top_assets_limit: default_top_assets(),
            remote_base_url: None,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or
    /// validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the TOML is invalid or values are
    /// inconsistent.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.expiring_horizon_days == 0 {
            return Err(ConfigError::Validation(
                "expiring_horizon_days must be at least 1".to_string(),
            ));
        }
        if let Some(url) = &self.remote_base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Validation(format!(
                    "remote_base_url must be an http(s) URL, got {url:?}"
                )));
            }
        }
        Ok(())
    }
}
