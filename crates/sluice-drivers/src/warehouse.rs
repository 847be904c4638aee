//! Warehouse driver (BigQuery) over the vendor job and catalog APIs
//!
//! The driver talks to the vendor through the `WarehouseApi` seam. The
//! production implementation is `BigQueryApi` (feature `bigquery`); tests
//! use an in-memory fake.
//!
//! ## Queries
//!
//! `execute_query` inserts an asynchronous query job and returns at once.
//! A background task polls the job until it completes, pages through the
//! rows and normalizes each cell. BigQuery's REST API boxes every value:
//! scalars arrive as strings inside `{"v": ...}`, records as `{"f": [...]}`
//! and repeated columns as arrays of boxed values. Normalization turns them
//! into plain JSON according to the result schema.
//!
//! ## Catalog
//!
//! `fetch_projects_and_datasets` pages through datasets (default page size
//! 10) and counts each dataset's tables without reading schemas.
//! `fetch_tables_for_dataset` lists one page of tables (default 1000) and
//! reads each table's schema. Record columns are parsed recursively.

use crate::driver::Driver;
use crate::jobs::JobTable;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use sluice_core::{
    BackendType, Dataset, DriverError, Field, JobId, JobResult, LogicalType, Nullability, Project,
    Row, Table, TablePage, WarehouseCredentials, WarehouseSettings,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Vendor job reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorJob {
    pub job_id: String,
    pub location: Option<String>,
}

/// One page of a vendor listing
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

/// Dataset as listed by the vendor
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRef {
    pub id: String,
    pub friendly_name: Option<String>,
}

/// Column schema as the vendor reports it
#[derive(Debug, Clone, PartialEq)]
pub struct RawField {
    pub name: String,
    pub field_type: String,
    /// `NULLABLE`, `REQUIRED` or `REPEATED`
    pub mode: Option<String>,
    pub description: Option<String>,
    pub fields: Vec<RawField>,
}

impl RawField {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            mode: None,
            description: None,
            fields: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: &str) -> Self {
        self.mode = Some(mode.to_string());
        self
    }

    pub fn with_fields(mut self, fields: Vec<RawField>) -> Self {
        self.fields = fields;
        self
    }

    fn is_repeated(&self) -> bool {
        self.mode
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("REPEATED"))
    }
}

/// Table metadata as the vendor reports it
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    pub id: String,
    pub friendly_name: Option<String>,
    pub description: Option<String>,
    pub fields: Vec<RawField>,
}

/// One poll of a query job's results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultsPage {
    /// `false` while the job is still running; the other fields are empty
    pub complete: bool,
    pub schema: Vec<RawField>,
    /// Top-level cells of each row, still boxed
    pub rows: Vec<Vec<Value>>,
    pub next_page_token: Option<String>,
}

/// Vendor calls the warehouse driver needs
#[async_trait::async_trait]
pub trait WarehouseApi: Send + Sync + 'static {
    /// Project the jobs run in and the catalog is listed from
    fn project_id(&self) -> &str;

    /// Build the vendor client
    async fn open(&self) -> Result<(), DriverError>;

    /// Drop the vendor client
    async fn close(&self);

    async fn list_datasets(
        &self,
        page_size: u32,
        page_token: Option<String>,
    ) -> Result<Page<DatasetRef>, DriverError>;

    /// Number of tables in a dataset, without reading any schema
    async fn count_tables(&self, dataset_id: &str) -> Result<u64, DriverError>;

    /// Table ids in a dataset
    async fn list_tables(
        &self,
        dataset_id: &str,
        page_size: u32,
        page_token: Option<String>,
    ) -> Result<Page<String>, DriverError>;

    async fn get_table(&self, dataset_id: &str, table_id: &str) -> Result<RawTable, DriverError>;

    /// Create a query job without waiting for it. `Err` carries the vendor
    /// message when the job is rejected outright.
    async fn insert_query_job(&self, sql: &str) -> Result<VendorJob, String>;

    /// Poll a job's results. `Err` carries the vendor message of a failed job.
    async fn query_results(
        &self,
        job: &VendorJob,
        page_token: Option<String>,
    ) -> Result<ResultsPage, String>;

    async fn cancel_job(&self, job: &VendorJob) -> Result<(), DriverError>;
}

/// BigQuery driver
pub struct WarehouseDriver {
    api: Arc<dyn WarehouseApi>,
    settings: WarehouseSettings,
    jobs: Arc<JobTable<Option<VendorJob>>>,
    connected: AtomicBool,
}

impl WarehouseDriver {
    /// Create a driver over any `WarehouseApi`
    pub fn new(api: Arc<dyn WarehouseApi>, settings: WarehouseSettings) -> Self {
        Self {
            api,
            settings,
            jobs: Arc::new(JobTable::new()),
            connected: AtomicBool::new(false),
        }
    }

    /// Create a BigQuery driver from service account credentials
    #[cfg(feature = "bigquery")]
    pub fn from_credentials(
        credentials: &WarehouseCredentials,
        settings: WarehouseSettings,
    ) -> Result<Self, DriverError> {
        let api = crate::bigquery::BigQueryApi::from_credentials(credentials)?;
        Ok(Self::new(Arc::new(api), settings))
    }

    /// Create driver without bigquery feature (returns error)
    #[cfg(not(feature = "bigquery"))]
    pub fn from_credentials(
        _credentials: &WarehouseCredentials,
        _settings: WarehouseSettings,
    ) -> Result<Self, DriverError> {
        Err(DriverError::Unsupported(
            "BigQuery support not compiled. Rebuild with: cargo build --features bigquery".to_string()
        ))
    }

    /// Jobs tracked and not yet consumed
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.len()
    }

    fn ensure_connected(&self) -> Result<(), DriverError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::Connection("warehouse driver is not connected".to_string()))
        }
    }

    /// Convert a BigQuery type name to LogicalType
    pub fn map_bigquery_type(bq_type: &str) -> LogicalType {
        // Handle parameterized types like NUMERIC(10,2) or ARRAY<STRING>
        let base_type = bq_type.split('(').next()
            .unwrap_or(bq_type)
            .split('<').next()
            .unwrap_or(bq_type)
            .trim()
            .to_uppercase();

        match base_type.as_str() {
            "BOOL" | "BOOLEAN" => LogicalType::Bool,

            "INT64" | "INTEGER" | "INT" | "SMALLINT" | "TINYINT" | "BYTEINT" => LogicalType::Int,

            "FLOAT64" | "FLOAT" => LogicalType::Float,

            "NUMERIC" | "BIGNUMERIC" | "DECIMAL" | "BIGDECIMAL" => Self::parse_numeric_type(bq_type),

            "STRING" => LogicalType::String,
            "BYTES" => LogicalType::Bytes,

            "DATE" => LogicalType::Date,
            "DATETIME" | "TIMESTAMP" | "TIME" => LogicalType::Timestamp,

            "GEOGRAPHY" | "INTERVAL" => LogicalType::String,
            "JSON" => LogicalType::Json,

            "ARRAY" => LogicalType::Array {
                element_type: Box::new(Self::extract_array_element_type(bq_type)),
            },

            "STRUCT" | "RECORD" => LogicalType::Struct,

            _ => LogicalType::Unknown,
        }
    }

    /// Parse NUMERIC(precision, scale) type
    fn parse_numeric_type(type_str: &str) -> LogicalType {
        if let Some(params) = type_str.split('(').nth(1) {
            if let Some(params) = params.strip_suffix(')') {
                let parts: Vec<&str> = params.split(',').collect();
                if parts.len() == 2 {
                    let precision = parts[0].trim().parse().ok();
                    let scale = parts[1].trim().parse().ok();
                    return LogicalType::Decimal { precision, scale };
                } else if parts.len() == 1 {
                    let precision = parts[0].trim().parse().ok();
                    return LogicalType::Decimal { precision, scale: Some(0) };
                }
            }
        }

        // Default for NUMERIC without parameters
        LogicalType::Decimal {
            precision: Some(38),
            scale: Some(9),
        }
    }

    /// Extract element type from ARRAY<TYPE>
    fn extract_array_element_type(type_str: &str) -> LogicalType {
        let element = type_str
            .find('<')
            .and_then(|start| type_str.get(start + 1..))
            .and_then(|rest| rest.rfind('>').map(|end| &rest[..end]));

        match element {
            Some(element) => Self::map_bigquery_type(element),
            None => LogicalType::Unknown,
        }
    }
}

/// Convert a vendor column schema into a `Field`, descending into records
pub fn parse_field(raw: &RawField) -> Field {
    let element = WarehouseDriver::map_bigquery_type(&raw.field_type);
    let mode = raw.mode.as_deref().map(str::to_uppercase);

    let (logical_type, nullable, repeated) = match mode.as_deref() {
        Some("REPEATED") => (
            LogicalType::Array { element_type: Box::new(element) },
            Nullability::No,
            true,
        ),
        Some("REQUIRED") => (element, Nullability::No, false),
        // NULLABLE is the vendor default when mode is omitted
        _ => (element, Nullability::Yes, false),
    };

    Field::new(raw.name.clone(), raw.field_type.clone(), logical_type)
        .with_nullability(nullable)
        .with_repeated(repeated)
        .with_description(raw.description.clone())
        .with_fields(raw.fields.iter().map(parse_field).collect())
}

/// Unbox one result row according to the result schema
pub fn normalize_row(schema: &[RawField], cells: Vec<Value>) -> Row {
    let mut row = Row::new();
    for (index, cell) in cells.into_iter().enumerate() {
        match schema.get(index) {
            Some(field) => {
                row.insert(field.name.clone(), normalize_value(field, cell));
            }
            None => {
                row.insert(format!("f{}", index), unbox(cell));
            }
        }
    }
    row
}

/// Unbox one cell. Accepts both the boxed `{"v": ...}` form and a bare value.
pub fn normalize_value(field: &RawField, value: Value) -> Value {
    let value = unbox(value);
    if value.is_null() {
        return Value::Null;
    }

    if field.is_repeated() {
        let element = RawField {
            mode: Some("NULLABLE".to_string()),
            ..field.clone()
        };
        return match value {
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| normalize_value(&element, item))
                    .collect(),
            ),
            other => other,
        };
    }

    match WarehouseDriver::map_bigquery_type(&field.field_type) {
        LogicalType::Struct => normalize_record(&field.fields, value),
        LogicalType::Int => match value {
            Value::String(s) => s
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or(Value::String(s)),
            other => other,
        },
        LogicalType::Float => match value {
            Value::String(s) => s
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                // NaN and Infinity stay as the vendor spelled them
                .unwrap_or(Value::String(s)),
            other => other,
        },
        LogicalType::Bool => match value {
            Value::String(s) if s.eq_ignore_ascii_case("true") => Value::Bool(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Value::Bool(false),
            other => other,
        },
        LogicalType::Timestamp if field.field_type.eq_ignore_ascii_case("TIMESTAMP") => {
            match value {
                Value::String(s) => epoch_seconds_to_rfc3339(&s)
                    .map(Value::String)
                    .unwrap_or(Value::String(s)),
                other => other,
            }
        }
        LogicalType::Json => match value {
            Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            other => other,
        },
        _ => value,
    }
}

/// Turn `{"f": [{"v": a}, {"v": b}]}` into `{"x": a, "y": b}`
fn normalize_record(fields: &[RawField], value: Value) -> Value {
    let cells = match value {
        Value::Object(mut map) => match map.remove("f") {
            Some(Value::Array(cells)) => cells,
            _ => return Value::Object(map),
        },
        Value::Array(cells) => cells,
        other => return other,
    };

    let mut record = Map::new();
    for (index, cell) in cells.into_iter().enumerate() {
        match fields.get(index) {
            Some(field) => {
                record.insert(field.name.clone(), normalize_value(field, cell));
            }
            None => {
                record.insert(format!("f{}", index), unbox(cell));
            }
        }
    }
    Value::Object(record)
}

/// Strip one `{"v": ...}` wrapper if present
fn unbox(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("v") => {
            map.remove("v").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// BigQuery serializes TIMESTAMP as floating point seconds since the epoch
fn epoch_seconds_to_rfc3339(raw: &str) -> Option<String> {
    let seconds: f64 = raw.trim().parse().ok()?;
    if !seconds.is_finite() {
        return None;
    }
    let micros = (seconds * 1_000_000.0).round() as i64;
    let timestamp = DateTime::<Utc>::from_timestamp_micros(micros)?;
    Some(timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Poll until the job completes, then drain and normalize every result page
async fn collect_results(
    api: Arc<dyn WarehouseApi>,
    job: VendorJob,
    poll_interval: Duration,
) -> JobResult {
    let mut schema: Option<Vec<RawField>> = None;
    let mut rows = Vec::new();
    let mut page_token = None;

    loop {
        let page = match api.query_results(&job, page_token.take()).await {
            Ok(page) => page,
            Err(message) => return JobResult::Error { message },
        };

        if !page.complete {
            tokio::time::sleep(poll_interval).await;
            continue;
        }

        let schema = schema.get_or_insert(page.schema);
        rows.extend(page.rows.into_iter().map(|cells| normalize_row(schema, cells)));

        match page.next_page_token {
            Some(token) => {
                tracing::debug!(job = %job.job_id, rows = rows.len(), "fetching next result page");
                page_token = Some(token);
            }
            None => break,
        }
    }

    JobResult::Complete { rows }
}

#[async_trait::async_trait]
impl Driver for WarehouseDriver {
    fn name(&self) -> &'static str {
        "BigQuery"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Warehouse
    }

    async fn connect(&self) -> Result<(), DriverError> {
        self.api.open().await?;
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(project = %self.api.project_id(), "warehouse client ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        let aborted = self.jobs.abort_all("connection closed");
        if self.connected.swap(false, Ordering::SeqCst) {
            self.api.close().await;
            tracing::info!(project = %self.api.project_id(), aborted, "warehouse client closed");
        }
        Ok(())
    }

    async fn execute_query(&self, sql: &str) -> Result<JobId, DriverError> {
        self.ensure_connected()?;

        match self.api.insert_query_job(sql).await {
            Ok(vendor_job) => {
                let job_id = self.jobs.register(Some(vendor_job.clone()));
                tracing::info!(job_id = %job_id, vendor_job = %vendor_job.job_id, "query job started");

                let api = Arc::clone(&self.api);
                let poll_interval = self.settings.poll_interval();
                self.jobs.spawn(&job_id, async move {
                    (collect_results(api, vendor_job, poll_interval).await, None)
                });
                Ok(job_id)
            }
            Err(message) => {
                // Rejected at submission: the job exists and has already failed.
                let job_id = self.jobs.register(None);
                self.jobs.resolve(&job_id, JobResult::Error { message }, None);
                Ok(job_id)
            }
        }
    }

    async fn cancel_job(&self, job_id: &JobId) -> Result<(), DriverError> {
        if let Some(Some(vendor_job)) = self.jobs.request_cancel(job_id)? {
            if let Err(e) = self.api.cancel_job(&vendor_job).await {
                tracing::warn!(job_id = %job_id, error = %e, "vendor cancel request failed");
            }
        }
        Ok(())
    }

    async fn get_job_result(&self, job_id: &JobId) -> Result<JobResult, DriverError> {
        self.jobs.wait(job_id).await
    }

    async fn fetch_projects_and_datasets(&self) -> Result<Vec<Project>, DriverError> {
        self.ensure_connected()?;

        let mut listed = Vec::new();
        let mut page_token = None;
        loop {
            let page = self
                .api
                .list_datasets(self.settings.dataset_page_size, page_token.take())
                .await?;
            tracing::debug!(count = page.items.len(), "listed dataset page");
            listed.extend(page.items);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        let mut datasets = Vec::with_capacity(listed.len());
        for dataset in listed {
            let table_count = self.api.count_tables(&dataset.id).await?;
            let name = dataset.friendly_name.unwrap_or_else(|| dataset.id.clone());
            datasets.push(Dataset::new(dataset.id, name, table_count));
        }

        let project_id = self.api.project_id().to_string();
        Ok(vec![Project::new(project_id.clone(), project_id, datasets)])
    }

    async fn fetch_tables_for_dataset(
        &self,
        dataset_id: &str,
        page_token: Option<&str>,
    ) -> Result<TablePage, DriverError> {
        self.ensure_connected()?;

        let page = self
            .api
            .list_tables(
                dataset_id,
                self.settings.table_page_size,
                page_token.map(str::to_string),
            )
            .await?;

        let mut tables = Vec::with_capacity(page.items.len());
        for table_id in &page.items {
            let raw = self.api.get_table(dataset_id, table_id).await?;
            let name = raw.friendly_name.clone().unwrap_or_else(|| raw.id.clone());
            let fields = raw.fields.iter().map(parse_field).collect();
            tables.push(Table::new(raw.id, name, fields).with_description(raw.description));
        }
        tracing::debug!(dataset = dataset_id, tables = tables.len(), more = page.next_page_token.is_some(), "fetched table page");

        Ok(TablePage {
            tables,
            next_page_token: page.next_page_token,
        })
    }
}
