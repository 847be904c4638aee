//! Driver trait implemented by every backend adapter

use sluice_core::{BackendType, DriverError, JobId, JobResult, Project, TablePage};

/// Uniform connect / execute / cancel / catalog contract
///
/// Implementations must be safe to call concurrently: two `execute_query`
/// calls on one driver run side by side and are canceled independently.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    /// Get the driver name (e.g., "BigQuery", "PostgreSQL")
    fn name(&self) -> &'static str;

    /// Backend family this driver speaks to
    fn backend_type(&self) -> BackendType;

    /// Establish the backend resource (vendor client or connection pool)
    ///
    /// Fails with `DriverError::Connection` on bad credentials or an
    /// unreachable host.
    async fn connect(&self) -> Result<(), DriverError>;

    /// Release the backend resource. Calling it twice is harmless.
    ///
    /// Jobs still running are aborted and resolve as errors.
    async fn disconnect(&self) -> Result<(), DriverError>;

    /// Start `sql` and return its job id without waiting for the statement
    /// to finish. Statement failures surface later through
    /// `get_job_result`.
    async fn execute_query(&self, sql: &str) -> Result<JobId, DriverError>;

    /// Ask the backend to stop a running job.
    ///
    /// A no-op for a job that already finished. If the request lands before
    /// the job finishes, the job resolves as `Canceled` even when the
    /// statement completes afterwards.
    async fn cancel_job(&self, job_id: &JobId) -> Result<(), DriverError>;

    /// Wait for the job's terminal result and consume it.
    ///
    /// A second call for the same id fails with `DriverError::JobNotFound`.
    async fn get_job_result(&self, job_id: &JobId) -> Result<JobResult, DriverError>;

    /// List projects and their datasets with table counts; `tables` stays
    /// empty.
    async fn fetch_projects_and_datasets(&self) -> Result<Vec<Project>, DriverError>;

    /// One page of tables, with full column schema, for a dataset
    async fn fetch_tables_for_dataset(
        &self,
        dataset_id: &str,
        page_token: Option<&str>,
    ) -> Result<TablePage, DriverError>;
}
