//! Errors raised across the driver boundary
//!
//! Statement failures are not errors here: they arrive after `execute_query`
//! has returned and are delivered as `JobResult::Error`.

use crate::job::JobId;

/// Errors that can occur when talking to a backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Catalog request failed: {0}")]
    Catalog(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl DriverError {
    /// Whether the error means an id did not resolve
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ConnectionNotFound(_) | Self::JobNotFound(_))
    }
}
