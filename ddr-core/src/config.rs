use crate::amount::Currency;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration value: {0}")]
    Invalid(String),
}

/// Tuning for the fungible state selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Retries after the first selection attempt before giving up
    pub max_retries: u32,

    /// Base backoff between attempts (in milliseconds)
    pub retry_sleep_ms: u64,

    /// Upper bound for the backoff before jitter (in milliseconds)
    pub retry_cap_ms: u64,

    /// Vault page size used while accumulating states
    pub page_size: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_retries: 8,
            retry_sleep_ms: 100,
            retry_cap_ms: 2000,
            page_size: 200,
        }
    }
}

/// Node-wide configuration, loaded from TOML
///
/// Every field has a default so an empty document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub selector: SelectorConfig,

    /// Lifetime of soft-lock reservations; `None` keeps them until released
    pub reservation_ttl_ms: Option<u64>,

    /// Largest token minted when approving a pledge (in minor units)
    pub mint_denomination: u64,

    /// Rebuild-and-retry cycles after losing a double-spend race
    pub conflict_retry_limit: u32,

    /// Immediate resubmissions to an unavailable notary before checkpointing
    pub notary_retry_limit: u32,

    /// Responder sessions left without finality this long are closed by the sweep
    pub session_timeout_ms: u64,

    pub default_currency: Currency,

    /// SQLite vault location; an in-memory vault is used when absent
    pub database_path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            selector: SelectorConfig::default(),
            reservation_ttl_ms: None,
            mint_denomination: 1000,
            conflict_retry_limit: 3,
            notary_retry_limit: 3,
            session_timeout_ms: 600_000,
            default_currency: Currency::MAD,
            database_path: None,
        }
    }
}

impl LedgerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: LedgerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.selector.page_size == 0 {
            return Err(ConfigError::Invalid("selector.page_size must be positive".into()));
        }
        if self.mint_denomination == 0 {
            return Err(ConfigError::Invalid("mint_denomination must be positive".into()));
        }
        Ok(())
    }
}
