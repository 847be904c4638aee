//! Configuration schema (sluice.toml)

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Warehouse catalog and job polling settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseSettings {
    /// Datasets per catalog page in `fetch_projects_and_datasets`
    pub dataset_page_size: u32,

    /// Tables per page in `fetch_tables_for_dataset`
    pub table_page_size: u32,

    /// Delay between job completion polls
    pub poll_interval_ms: u64,
}

impl Default for WarehouseSettings {
    fn default() -> Self {
        Self {
            dataset_page_size: 10,
            table_page_size: 1000,
            poll_interval_ms: 500,
        }
    }
}

impl WarehouseSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Relational pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalSettings {
    /// Upper bound on pooled connections per integration
    pub pool_max_size: usize,

    /// How long `execute_query` waits for a free pool client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for RelationalSettings {
    fn default() -> Self {
        Self {
            pool_max_size: 10,
            acquire_timeout_ms: None,
        }
    }
}

impl RelationalSettings {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

/// Job result settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Upper bound on a single `get_job_result` wait
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_timeout_ms: Option<u64>,
}

impl JobSettings {
    pub fn result_timeout(&self) -> Option<Duration> {
        self.result_timeout_ms.map(Duration::from_millis)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub warehouse: WarehouseSettings,

    #[serde(default)]
    pub relational: RelationalSettings,

    #[serde(default)]
    pub jobs: JobSettings,
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config = Self::from_toml(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Reject settings the backends cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.warehouse.dataset_page_size == 0 || self.warehouse.table_page_size == 0 {
            return Err(ConfigError::Invalid("page sizes must be at least 1".to_string()));
        }
        if self.relational.pool_max_size == 0 {
            return Err(ConfigError::Invalid("pool_max_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
