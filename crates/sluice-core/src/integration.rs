//! Integration records supplied by the credentials store
//!
//! An integration names one external backend and carries the credentials
//! needed to reach it. The core reads these records and never persists them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

use crate::config::ConfigError;

/// Backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Columnar cloud warehouse (BigQuery)
    Warehouse,

    /// Relational server (PostgreSQL)
    Relational,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warehouse => write!(f, "warehouse"),
            Self::Relational => write!(f, "relational"),
        }
    }
}

/// Service account credentials for the warehouse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarehouseCredentials {
    /// Billing/query project; defaults to the key's `project_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    /// Service account key JSON, as uploaded
    pub service_account: Value,
}

impl WarehouseCredentials {
    /// Service account key with every object key lowercased and `-`/space
    /// replaced by `_`, the shape the Google auth libraries expect.
    pub fn normalized_key(&self) -> Value {
        normalize_key_case(&self.service_account)
    }

    /// The project to run jobs in
    pub fn resolved_project_id(&self) -> Option<String> {
        self.project_id.clone().or_else(|| {
            self.normalized_key()
                .get("project_id")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    }
}

/// Normalize object keys recursively. Values are left untouched.
pub fn normalize_key_case(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let normalized: Map<String, Value> = map
                .iter()
                .map(|(k, v)| {
                    let key = k
                        .trim()
                        .to_lowercase()
                        .replace(['-', ' '], "_");
                    (key, normalize_key_case(v))
                })
                .collect();
            Value::Object(normalized)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_key_case).collect()),
        other => other.clone(),
    }
}

fn default_pg_port() -> u16 {
    5432
}

/// Connection settings for the relational server
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationalCredentials {
    pub host: String,

    #[serde(default = "default_pg_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default, skip_serializing)]
    pub password: String,

    /// Require TLS
    #[serde(default)]
    pub ssl: bool,
}

impl std::fmt::Debug for RelationalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("ssl", &self.ssl)
            .finish()
    }
}

/// Credentials discriminated by backend type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backendType", rename_all = "lowercase")]
pub enum BackendCredentials {
    Warehouse(WarehouseCredentials),
    Relational(RelationalCredentials),
}

impl BackendCredentials {
    pub fn backend_type(&self) -> BackendType {
        match self {
            Self::Warehouse(_) => BackendType::Warehouse,
            Self::Relational(_) => BackendType::Relational,
        }
    }
}

/// A configured backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    pub id: String,

    pub name: String,

    pub credentials: BackendCredentials,

    /// Free-form settings owned by the caller
    #[serde(default)]
    pub config: HashMap<String, Value>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Integration {
    /// Create an integration stamped with the current time
    pub fn new(id: impl Into<String>, name: impl Into<String>, credentials: BackendCredentials) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            credentials,
            config: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn backend_type(&self) -> BackendType {
        self.credentials.backend_type()
    }

    /// Load an integration from a `.json` or `.toml` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(e.to_string())),
            _ => serde_json::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(e.to_string())),
        }
    }
}
