//! Mock driver for testing
//!
//! Serves a predefined catalog and scripted query outcomes without talking
//! to any backend. It's useful for:
//! - Unit testing the registry and the metadata fetcher
//! - Exercising job lifecycles (cancel races, consumption) deterministically
//! - Demos without real credentials
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sluice_drivers::{Driver, MockDriver, MockQuery};
//!
//! let driver = MockDriver::new()
//!     .with_projects(vec![project])
//!     .with_table_pages("sales", vec![first_page, second_page])
//!     .with_query("SELECT", MockQuery::rows(rows).after(Duration::from_millis(50)));
//!
//! driver.connect().await?;
//! let job = driver.execute_query("SELECT 1").await?;
//! let result = driver.get_job_result(&job).await?;
//! ```
//!
//! ## Simulating Failures
//!
//! ```rust,ignore
//! // Connection refused
//! let driver = MockDriver::new().with_connection_failure();
//!
//! // Slow catalog calls
//! let driver = MockDriver::new().with_latency(100);
//! ```

use crate::driver::Driver;
use crate::jobs::JobTable;
use sluice_core::{
    BackendType, DriverError, JobId, JobResult, Project, Row, Table, TablePage,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};

/// Scripted outcome for queries matching a SQL fragment
#[derive(Debug, Clone)]
pub struct MockQuery {
    outcome: JobResult,
    runtime: Duration,
}

impl MockQuery {
    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            outcome: JobResult::Complete { rows },
            runtime: Duration::ZERO,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            outcome: JobResult::error(message),
            runtime: Duration::ZERO,
        }
    }

    /// Keep the job running for `runtime` before it resolves
    pub fn after(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }
}

#[derive(Debug, Default)]
struct Calls {
    connect: AtomicUsize,
    catalog: AtomicUsize,
    tables: AtomicUsize,
    cancel: AtomicUsize,
}

/// Stand-in for a backend resource (client or pooled session)
struct Lease {
    open: Arc<AtomicUsize>,
}

impl Lease {
    fn take(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self {
            open: Arc::clone(open),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory driver with a scripted catalog and scripted queries
pub struct MockDriver {
    /// Projects served by `fetch_projects_and_datasets`
    projects: RwLock<Vec<Project>>,

    /// Table pages per dataset id
    table_pages: RwLock<HashMap<String, Vec<Vec<Table>>>>,

    /// Errors to return for specific datasets
    table_errors: RwLock<HashMap<String, DriverError>>,

    /// (sql fragment, outcome); first match wins
    queries: RwLock<Vec<(String, MockQuery)>>,

    /// Simulate connection failure
    fail_connection: bool,

    /// Simulate catalog latency (milliseconds)
    latency_ms: u64,

    backend: BackendType,
    adapter_name: &'static str,

    jobs: Arc<JobTable<Arc<Notify>, Lease>>,
    client: std::sync::Mutex<Option<Lease>>,
    open: Arc<AtomicUsize>,
    connected: AtomicBool,
    calls: Calls,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a mock driver with an empty catalog
    pub fn new() -> Self {
        Self {
            projects: RwLock::new(Vec::new()),
            table_pages: RwLock::new(HashMap::new()),
            table_errors: RwLock::new(HashMap::new()),
            queries: RwLock::new(Vec::new()),
            fail_connection: false,
            latency_ms: 0,
            backend: BackendType::Warehouse,
            adapter_name: "Mock",
            jobs: Arc::new(JobTable::new()),
            client: std::sync::Mutex::new(None),
            open: Arc::new(AtomicUsize::new(0)),
            connected: AtomicBool::new(false),
            calls: Calls::default(),
        }
    }

    /// Catalog served by `fetch_projects_and_datasets`
    pub fn with_projects(mut self, projects: Vec<Project>) -> Self {
        *self.projects.get_mut() = projects;
        self
    }

    /// Single page of tables for a dataset
    pub fn with_tables(self, dataset_id: &str, tables: Vec<Table>) -> Self {
        self.with_table_pages(dataset_id, vec![tables])
    }

    /// Tables for a dataset split across pages; every page but the last
    /// carries a continuation token
    pub fn with_table_pages(mut self, dataset_id: &str, pages: Vec<Vec<Table>>) -> Self {
        self.table_pages.get_mut().insert(dataset_id.to_string(), pages);
        self
    }

    /// Fail table fetches for one dataset
    pub fn with_table_error(mut self, dataset_id: &str, error: DriverError) -> Self {
        self.table_errors.get_mut().insert(dataset_id.to_string(), error);
        self
    }

    /// Script the outcome of queries whose SQL contains `fragment`
    pub fn with_query(mut self, fragment: &str, query: MockQuery) -> Self {
        self.queries.get_mut().push((fragment.to_string(), query));
        self
    }

    /// Configure to fail every `connect`
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Configure simulated latency for connect and catalog calls
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Report a different backend family
    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    /// Set a custom driver name
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.adapter_name = name;
        self
    }

    /// Replace the table pages of a dataset at runtime
    pub async fn set_table_pages(&self, dataset_id: &str, pages: Vec<Vec<Table>>) {
        self.table_pages.write().await.insert(dataset_id.to_string(), pages);
    }

    /// Add a query script at runtime
    pub async fn add_query(&self, fragment: &str, query: MockQuery) {
        self.queries.write().await.push((fragment.to_string(), query));
    }

    /// Client plus sessions held by unconsumed jobs
    pub fn open_resources(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.calls.connect.load(Ordering::SeqCst)
    }

    /// Calls to `fetch_projects_and_datasets`
    pub fn catalog_calls(&self) -> usize {
        self.calls.catalog.load(Ordering::SeqCst)
    }

    /// Calls to `fetch_tables_for_dataset`
    pub fn table_calls(&self) -> usize {
        self.calls.tables.load(Ordering::SeqCst)
    }

    /// Cancel requests that reached a running job
    pub fn cancel_calls(&self) -> usize {
        self.calls.cancel.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }
    }

    fn ensure_connected(&self) -> Result<(), DriverError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DriverError::Connection("mock driver is not connected".to_string()))
        }
    }

    async fn scripted(&self, sql: &str) -> MockQuery {
        self.queries
            .read()
            .await
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, query)| query.clone())
            .unwrap_or_else(|| MockQuery::rows(Vec::new()))
    }
}

fn page_index(token: Option<&str>) -> Result<usize, DriverError> {
    match token {
        None => Ok(0),
        Some(token) => token
            .strip_prefix("page-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| DriverError::Catalog(format!("invalid page token: {}", token))),
    }
}

#[async_trait::async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        self.adapter_name
    }

    fn backend_type(&self) -> BackendType {
        self.backend
    }

    async fn connect(&self) -> Result<(), DriverError> {
        self.calls.connect.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if self.fail_connection {
            return Err(DriverError::Connection(
                "Mock connection failure (simulated)".to_string(),
            ));
        }

        let mut client = self.client.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if client.is_none() {
            *client = Some(Lease::take(&self.open));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.jobs.abort_all("connection closed");
        self.client
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn execute_query(&self, sql: &str) -> Result<JobId, DriverError> {
        self.ensure_connected()?;

        let script = self.scripted(sql).await;
        let signal = Arc::new(Notify::new());
        let lease = Lease::take(&self.open);
        let job_id = self.jobs.register(Arc::clone(&signal));

        self.jobs.spawn(&job_id, async move {
            let outcome = tokio::select! {
                _ = tokio::time::sleep(script.runtime) => script.outcome,
                _ = signal.notified() => JobResult::Canceled,
            };
            (outcome, Some(lease))
        });
        Ok(job_id)
    }

    async fn cancel_job(&self, job_id: &JobId) -> Result<(), DriverError> {
        if let Some(signal) = self.jobs.request_cancel(job_id)? {
            self.calls.cancel.fetch_add(1, Ordering::SeqCst);
            signal.notify_one();
        }
        Ok(())
    }

    async fn get_job_result(&self, job_id: &JobId) -> Result<JobResult, DriverError> {
        self.jobs.wait(job_id).await
    }

    async fn fetch_projects_and_datasets(&self) -> Result<Vec<Project>, DriverError> {
        self.calls.catalog.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;
        self.simulate_latency().await;
        Ok(self.projects.read().await.clone())
    }

    async fn fetch_tables_for_dataset(
        &self,
        dataset_id: &str,
        page_token: Option<&str>,
    ) -> Result<TablePage, DriverError> {
        self.calls.tables.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;
        self.simulate_latency().await;

        if let Some(error) = self.table_errors.read().await.get(dataset_id) {
            return Err(error.clone());
        }

        let pages = self.table_pages.read().await;
        let Some(pages) = pages.get(dataset_id) else {
            return Ok(TablePage::default());
        };

        let index = page_index(page_token)?;
        let tables = pages.get(index).cloned().unwrap_or_default();
        let next_page_token = (index + 1 < pages.len()).then(|| format!("page-{}", index + 1));

        Ok(TablePage {
            tables,
            next_page_token,
        })
    }
}
