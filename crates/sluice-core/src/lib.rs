//! Sluice Core
//!
//! Domain model shared by the drivers, the registry and the metadata
//! fetcher: integrations, jobs, the catalog tree and configuration.

pub mod config;
pub mod error;
pub mod integration;
pub mod job;
pub mod metadata;

pub use config::{Config, ConfigError, JobSettings, RelationalSettings, WarehouseSettings};
pub use error::DriverError;
pub use integration::{
    BackendCredentials, BackendType, Integration, RelationalCredentials, WarehouseCredentials,
};
pub use job::{JobId, JobResult, JobStatus, Row};
pub use metadata::{Dataset, Field, LogicalType, MetadataTree, Nullability, Project, Table, TablePage};
