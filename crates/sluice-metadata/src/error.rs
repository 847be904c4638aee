//! Fetcher errors

use sluice_core::DriverError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// `fetch_metadata_incremental` has not produced a tree for this
    /// connection yet
    #[error("Metadata not fetched for connection {0}")]
    NotFetched(String),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("Table not found: {dataset_id}.{table_id}")]
    TableNotFound { dataset_id: String, table_id: String },
}
