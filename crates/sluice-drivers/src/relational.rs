//! Relational (PostgreSQL) driver
//!
//! Every query job checks a session out of the pool and keeps it until the
//! result is consumed. The session's backend pid is recorded at start so a
//! cancel request can target exactly that statement. Cancel signals travel
//! over their own socket and never wait on a pool slot.
//!
//! The pool itself sits behind [`SessionPool`]; the production pool lives in
//! `postgres.rs` (feature `postgres`).

use crate::driver::Driver;
use crate::jobs::JobTable;
use serde_json::Value;
use sluice_core::{
    BackendType, Dataset, DriverError, Field, JobId, JobResult, LogicalType, Nullability, Project,
    Row, Table, TablePage,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// SQLSTATE raised by the server for a canceled statement (`query_canceled`)
pub const QUERY_CANCELED: &str = "57014";

/// Server message for a statement stopped by a cancel request. Only consulted
/// when the error carries no SQLSTATE.
pub const CANCELED_BY_USER_MESSAGE: &str = "canceling statement due to user request";

/// How often a cancel is re-sent while the statement keeps running
const CANCEL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A statement failure as reported by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementError {
    /// SQLSTATE, when the server sent one
    pub code: Option<String>,
    pub message: String,
}

impl StatementError {
    pub fn new(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    /// Whether the statement was stopped by a cancel request
    pub fn is_cancellation(&self) -> bool {
        match &self.code {
            Some(code) => code == QUERY_CANCELED,
            None => self.message.contains(CANCELED_BY_USER_MESSAGE),
        }
    }
}

impl std::fmt::Display for StatementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (SQLSTATE {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// Sends an out-of-band cancel for one backend process
#[async_trait::async_trait]
pub trait BackendCanceller: Clone + Send + Sync + 'static {
    async fn cancel(&self) -> Result<(), DriverError>;
}

/// One checked-out connection. Dropping it returns it to the pool.
#[async_trait::async_trait]
pub trait Session: Send + 'static {
    type Canceller: BackendCanceller;

    /// Server process id serving this session
    async fn backend_pid(&mut self) -> Result<i32, StatementError>;

    /// Handle able to cancel whatever this session is running
    fn canceller(&self) -> Self::Canceller;

    /// Run `sql` with text parameters and decode every row
    async fn query(&mut self, sql: &str, params: &[&str]) -> Result<Vec<Row>, StatementError>;
}

/// Bounded pool of sessions
#[async_trait::async_trait]
pub trait SessionPool: Send + Sync + 'static {
    type Session: Session;

    /// Build the pool. Does not have to contact the server.
    async fn open(&self) -> Result<(), DriverError>;

    /// Check out a session, waiting for a free slot
    async fn acquire(&self) -> Result<Self::Session, DriverError>;

    /// Close the pool; sessions still checked out are discarded on return
    async fn close(&self);

    /// Sessions currently checked out
    fn checked_out(&self) -> usize;
}

/// Correlation data for a running statement
#[derive(Clone)]
pub struct BackendJob<C> {
    pub backend_pid: i32,
    canceller: C,
}

type CancellerOf<P> = <<P as SessionPool>::Session as Session>::Canceller;

const DATABASE_SQL: &str = "SELECT current_database()::text AS database";

const SCHEMAS_SQL: &str = r#"
    SELECT
        n.nspname::text AS schema_name,
        obj_description(n.oid, 'pg_namespace') AS description,
        COUNT(t.table_name)::int8 AS table_count
    FROM pg_catalog.pg_namespace n
    LEFT JOIN information_schema.tables t
        ON t.table_schema = n.nspname
    WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
      AND n.nspname NOT LIKE 'pg\_toast%'
      AND n.nspname NOT LIKE 'pg\_temp\_%'
    GROUP BY n.nspname, n.oid
    ORDER BY n.nspname
"#;

const TABLES_SQL: &str = r#"
    SELECT
        t.table_name::text AS table_name,
        obj_description(format('%I.%I', t.table_schema, t.table_name)::regclass, 'pg_class') AS table_description,
        c.column_name::text AS column_name,
        c.data_type::text AS data_type,
        c.udt_name::text AS udt_name,
        c.is_nullable::text AS is_nullable,
        c.numeric_precision::int4 AS numeric_precision,
        c.numeric_scale::int4 AS numeric_scale,
        col_description(format('%I.%I', t.table_schema, t.table_name)::regclass, c.ordinal_position::int4) AS column_description
    FROM information_schema.tables t
    LEFT JOIN information_schema.columns c
        ON c.table_schema = t.table_schema
       AND c.table_name = t.table_name
    WHERE t.table_schema = $1::text
    ORDER BY t.table_name, c.ordinal_position
"#;

/// PostgreSQL driver over any [`SessionPool`]
pub struct RelationalDriver<P: SessionPool> {
    pool: Arc<P>,
    jobs: Arc<JobTable<BackendJob<CancellerOf<P>>, P::Session>>,
    connected: AtomicBool,
}

impl<P: SessionPool> RelationalDriver<P> {
    pub fn new(pool: P) -> Self {
        Self {
            pool: Arc::new(pool),
            jobs: Arc::new(JobTable::new()),
            connected: AtomicBool::new(false),
        }
    }

    /// Sessions currently checked out of the pool
    pub fn open_sessions(&self) -> usize {
        self.pool.checked_out()
    }

    /// Backend pid serving a job, while the job is tracked
    pub fn backend_pid(&self, job_id: &JobId) -> Option<i32> {
        self.jobs.metadata(job_id).map(|job| job.backend_pid)
    }

    fn ensure_connected(&self) -> Result<(), DriverError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::Connection("relational driver is not connected".to_string()))
        }
    }

    async fn catalog_query(&self, sql: &str, params: &[&str]) -> Result<Vec<Row>, DriverError> {
        let mut session = self.pool.acquire().await?;
        session
            .query(sql, params)
            .await
            .map_err(|e| DriverError::Catalog(e.to_string()))
    }
}

/// Convert a PostgreSQL type name to LogicalType
pub fn map_postgres_type(pg_type: &str) -> LogicalType {
    let base_type = pg_type
        .split('(')
        .next()
        .unwrap_or(pg_type)
        .trim()
        .to_lowercase();

    match base_type.as_str() {
        "boolean" | "bool" => LogicalType::Bool,

        "smallint" | "int2" | "integer" | "int" | "int4" | "bigint" | "int8" => LogicalType::Int,
        "serial" | "serial4" | "bigserial" | "serial8" | "smallserial" | "serial2" => LogicalType::Int,
        "oid" => LogicalType::Int,

        "real" | "float4" | "double precision" | "float8" | "float" => LogicalType::Float,

        "numeric" | "decimal" => parse_numeric_type(pg_type),
        "money" => LogicalType::Decimal {
            precision: Some(19),
            scale: Some(2),
        },

        "character varying" | "varchar" | "character" | "char" | "bpchar" | "text" | "name"
        | "citext" | "uuid" | "xml" | "interval" => LogicalType::String,

        "bytea" => LogicalType::Bytes,

        "date" => LogicalType::Date,
        "timestamp without time zone" | "timestamp" | "timestamp with time zone"
        | "timestamptz" | "time without time zone" | "time" | "time with time zone"
        | "timetz" => LogicalType::Timestamp,

        "json" | "jsonb" => LogicalType::Json,

        "inet" | "cidr" | "macaddr" | "macaddr8" => LogicalType::String,

        "user-defined" => LogicalType::Unknown,
        "array" => LogicalType::Array {
            element_type: Box::new(LogicalType::Unknown),
        },

        _ => {
            if let Some(element) = pg_type.strip_suffix("[]") {
                LogicalType::Array {
                    element_type: Box::new(map_postgres_type(element)),
                }
            } else if let Some(element) = pg_type.strip_prefix('_') {
                // Internal array spelling: _int4 is int4[]
                LogicalType::Array {
                    element_type: Box::new(map_postgres_type(element)),
                }
            } else {
                LogicalType::Unknown
            }
        }
    }
}

fn parse_numeric_type(type_str: &str) -> LogicalType {
    if let Some(params) = type_str.split('(').nth(1).and_then(|p| p.strip_suffix(')')) {
        let parts: Vec<&str> = params.split(',').collect();
        match parts.as_slice() {
            [precision, scale] => {
                return LogicalType::Decimal {
                    precision: precision.trim().parse().ok(),
                    scale: scale.trim().parse().ok(),
                }
            }
            [precision] => {
                return LogicalType::Decimal {
                    precision: precision.trim().parse().ok(),
                    scale: Some(0),
                }
            }
            _ => {}
        }
    }

    LogicalType::Decimal {
        precision: None,
        scale: None,
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    row.get(column).and_then(Value::as_str).map(str::to_string)
}

fn integer(row: &Row, column: &str) -> Option<i64> {
    row.get(column).and_then(Value::as_i64)
}

/// Display type of an information_schema column, with numeric precision and
/// array element spelled out
fn column_type(row: &Row) -> String {
    let data_type = text(row, "data_type").unwrap_or_default();
    let udt_name = text(row, "udt_name").unwrap_or_default();

    if data_type == "numeric" {
        match (integer(row, "numeric_precision"), integer(row, "numeric_scale")) {
            (Some(p), Some(s)) => format!("numeric({},{})", p, s),
            (Some(p), None) => format!("numeric({})", p),
            _ => data_type,
        }
    } else if let Some(element) = udt_name.strip_prefix('_') {
        format!("{}[]", element)
    } else if data_type == "USER-DEFINED" {
        udt_name
    } else {
        data_type
    }
}

fn column_field(row: &Row) -> Option<Field> {
    let name = text(row, "column_name")?;
    let data_type = column_type(row);
    let logical_type = map_postgres_type(&data_type);
    let nullable = match text(row, "is_nullable").as_deref() {
        Some("YES") => Nullability::Yes,
        Some("NO") => Nullability::No,
        _ => Nullability::Unknown,
    };
    let repeated = matches!(logical_type, LogicalType::Array { .. });

    Some(
        Field::new(name, data_type, logical_type)
            .with_nullability(nullable)
            .with_repeated(repeated)
            .with_description(text(row, "column_description")),
    )
}

/// Fold a table × column listing, ordered by table, into tables
fn group_tables(rows: &[Row]) -> Vec<Table> {
    let mut tables: Vec<Table> = Vec::new();
    for row in rows {
        let Some(table_name) = text(row, "table_name") else {
            continue;
        };

        if tables.last().map(|t| t.id.as_str()) != Some(table_name.as_str()) {
            tables.push(
                Table::new(table_name.clone(), table_name, Vec::new())
                    .with_description(text(row, "table_description")),
            );
        }
        if let (Some(table), Some(field)) = (tables.last_mut(), column_field(row)) {
            table.fields.push(field);
        }
    }
    tables
}

#[async_trait::async_trait]
impl<P: SessionPool> Driver for RelationalDriver<P> {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Relational
    }

    async fn connect(&self) -> Result<(), DriverError> {
        self.pool.open().await?;

        // Check a session out and straight back in to prove the credentials
        match self.pool.acquire().await {
            Ok(session) => drop(session),
            Err(e) => {
                self.pool.close().await;
                return Err(e);
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("relational pool ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        let aborted = self.jobs.abort_all("connection closed");
        if self.connected.swap(false, Ordering::SeqCst) {
            self.pool.close().await;
            tracing::info!(aborted, "relational pool closed");
        }
        Ok(())
    }

    async fn execute_query(&self, sql: &str) -> Result<JobId, DriverError> {
        self.ensure_connected()?;

        let mut session = self.pool.acquire().await?;
        let backend_pid = session
            .backend_pid()
            .await
            .map_err(|e| DriverError::Connection(format!("failed to read backend pid: {}", e)))?;
        let canceller = session.canceller();

        let job_id = self.jobs.register(BackendJob {
            backend_pid,
            canceller: canceller.clone(),
        });
        let mut cancel = self
            .jobs
            .cancel_signal(&job_id)
            .ok_or_else(|| DriverError::JobNotFound(job_id.clone()))?;
        tracing::info!(job_id = %job_id, backend_pid, "query job started");

        let sql = sql.to_string();
        self.jobs.spawn(&job_id, async move {
            if cancel.is_requested() {
                return (JobResult::Canceled, Some(session));
            }

            let result = {
                let query = session.query(&sql, &[]);
                tokio::pin!(query);
                tokio::select! {
                    result = &mut query => result,
                    () = cancel.requested() => {
                        // The server drops a cancel that reaches an idle
                        // backend, so repeat it until the statement stops.
                        let mut retry = tokio::time::interval(CANCEL_RETRY_INTERVAL);
                        loop {
                            tokio::select! {
                                result = &mut query => break result,
                                _ = retry.tick() => {
                                    if let Err(e) = canceller.cancel().await {
                                        tracing::warn!(backend_pid, error = %e, "cancel resend failed");
                                    }
                                }
                            }
                        }
                    }
                }
            };

            let outcome = match result {
                Ok(rows) => JobResult::Complete { rows },
                Err(e) if e.is_cancellation() => JobResult::Canceled,
                Err(e) => JobResult::error(e.message),
            };
            (outcome, Some(session))
        });

        Ok(job_id)
    }

    async fn cancel_job(&self, job_id: &JobId) -> Result<(), DriverError> {
        if let Some(job) = self.jobs.request_cancel(job_id)? {
            tracing::info!(job_id = %job_id, backend_pid = job.backend_pid, "sending cancel request");
            if let Err(e) = job.canceller.cancel().await {
                tracing::warn!(job_id = %job_id, backend_pid = job.backend_pid, error = %e, "cancel request failed");
            }
        }
        Ok(())
    }

    async fn get_job_result(&self, job_id: &JobId) -> Result<JobResult, DriverError> {
        self.jobs.wait(job_id).await
    }

    async fn fetch_projects_and_datasets(&self) -> Result<Vec<Project>, DriverError> {
        self.ensure_connected()?;

        let database = self
            .catalog_query(DATABASE_SQL, &[])
            .await?
            .first()
            .and_then(|row| text(row, "database"))
            .ok_or_else(|| DriverError::Catalog("current_database() returned nothing".to_string()))?;

        let datasets: Vec<Dataset> = self
            .catalog_query(SCHEMAS_SQL, &[])
            .await?
            .iter()
            .filter_map(|row| {
                let schema = text(row, "schema_name")?;
                let count = integer(row, "table_count").unwrap_or(0).max(0) as u64;
                Some(
                    Dataset::new(schema.clone(), schema, count)
                        .with_description(text(row, "description")),
                )
            })
            .collect();
        tracing::debug!(database = %database, schemas = datasets.len(), "listed schemas");

        Ok(vec![Project::new(database.clone(), database, datasets)])
    }

    async fn fetch_tables_for_dataset(
        &self,
        dataset_id: &str,
        _page_token: Option<&str>,
    ) -> Result<TablePage, DriverError> {
        self.ensure_connected()?;

        let rows = self.catalog_query(TABLES_SQL, &[dataset_id]).await?;
        let tables = group_tables(&rows);
        tracing::debug!(schema = dataset_id, tables = tables.len(), "fetched tables");

        Ok(TablePage::last(tables))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI32, AtomicUsize};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Clone)]
    pub enum Scripted {
        Rows(Vec<Row>),
        Fail(StatementError),
        /// Runs until canceled or until the duration passes
        Slow(Duration, Vec<Row>),
    }

    #[derive(Default)]
    pub struct PoolState {
        open: AtomicBool,
        pub checked_out: AtomicUsize,
        next_pid: AtomicI32,
        /// Backends that were executing a statement when a cancel arrived
        pub canceled: Mutex<HashSet<i32>>,
        /// Cancels that reached an idle backend and did nothing
        pub ignored_cancels: AtomicUsize,
        executing: Mutex<HashSet<i32>>,
        interrupted: Mutex<HashSet<i32>>,
        /// Delay between sending a statement and the server starting it
        transit: Mutex<Duration>,
        /// (sql fragment, outcome); first match wins
        script: Mutex<Vec<(String, Scripted)>>,
        fail_acquire: AtomicBool,
    }

    #[derive(Clone, Default)]
    pub struct ScriptedPool {
        pub state: Arc<PoolState>,
    }

    impl ScriptedPool {
        pub fn on(self, fragment: &str, outcome: Scripted) -> Self {
            self.state
                .script
                .lock()
                .unwrap()
                .push((fragment.to_string(), outcome));
            self
        }

        pub fn with_transit(self, transit: Duration) -> Self {
            *self.state.transit.lock().unwrap() = transit;
            self
        }

        pub fn refusing(self) -> Self {
            self.state.fail_acquire.store(true, Ordering::SeqCst);
            self
        }
    }

    pub struct ScriptedSession {
        pid: i32,
        state: Arc<PoolState>,
    }

    impl Drop for ScriptedSession {
        fn drop(&mut self) {
            self.state.checked_out.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone)]
    pub struct ScriptedCanceller {
        pid: i32,
        state: Arc<PoolState>,
    }

    #[async_trait::async_trait]
    impl BackendCanceller for ScriptedCanceller {
        async fn cancel(&self) -> Result<(), DriverError> {
            // Like the server: only a statement in progress is interrupted
            if self.state.executing.lock().unwrap().contains(&self.pid) {
                self.state.interrupted.lock().unwrap().insert(self.pid);
                self.state.canceled.lock().unwrap().insert(self.pid);
            } else {
                self.state.ignored_cancels.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Session for ScriptedSession {
        type Canceller = ScriptedCanceller;

        async fn backend_pid(&mut self) -> Result<i32, StatementError> {
            Ok(self.pid)
        }

        fn canceller(&self) -> ScriptedCanceller {
            ScriptedCanceller {
                pid: self.pid,
                state: Arc::clone(&self.state),
            }
        }

        async fn query(&mut self, sql: &str, _params: &[&str]) -> Result<Vec<Row>, StatementError> {
            let scripted = self
                .state
                .script
                .lock()
                .unwrap()
                .iter()
                .find(|(fragment, _)| sql.contains(fragment.as_str()))
                .map(|(_, outcome)| outcome.clone());

            match scripted {
                None => Err(StatementError::new(Some("42601"), format!("unscripted: {}", sql))),
                Some(Scripted::Rows(rows)) => Ok(rows),
                Some(Scripted::Fail(e)) => Err(e),
                Some(Scripted::Slow(runtime, rows)) => {
                    let transit = *self.state.transit.lock().unwrap();
                    tokio::time::sleep(transit).await;

                    self.state.executing.lock().unwrap().insert(self.pid);
                    let deadline = Instant::now() + runtime;
                    let outcome = loop {
                        if self.state.interrupted.lock().unwrap().remove(&self.pid) {
                            break Err(StatementError::new(
                                Some(QUERY_CANCELED),
                                CANCELED_BY_USER_MESSAGE,
                            ));
                        }
                        if Instant::now() >= deadline {
                            break Ok(rows);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    };
                    self.state.executing.lock().unwrap().remove(&self.pid);
                    outcome
                }
            }
        }
    }

    #[async_trait::async_trait]
    impl SessionPool for ScriptedPool {
        type Session = ScriptedSession;

        async fn open(&self) -> Result<(), DriverError> {
            self.state.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn acquire(&self) -> Result<ScriptedSession, DriverError> {
            if self.state.fail_acquire.load(Ordering::SeqCst) {
                return Err(DriverError::Connection("password authentication failed".to_string()));
            }
            if !self.state.open.load(Ordering::SeqCst) {
                return Err(DriverError::Connection("pool is closed".to_string()));
            }
            self.state.checked_out.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedSession {
                pid: 1000 + self.state.next_pid.fetch_add(1, Ordering::SeqCst),
                state: Arc::clone(&self.state),
            })
        }

        async fn close(&self) {
            self.state.open.store(false, Ordering::SeqCst);
        }

        fn checked_out(&self) -> usize {
            self.state.checked_out.load(Ordering::SeqCst)
        }
    }

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    async fn connected(pool: ScriptedPool) -> RelationalDriver<ScriptedPool> {
        let driver = RelationalDriver::new(pool);
        driver.connect().await.unwrap();
        driver
    }

    async fn wait_for_idle(driver: &RelationalDriver<ScriptedPool>) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while driver.open_sessions() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn cancellation_detected_by_sqlstate() {
        assert!(StatementError::new(Some("57014"), "anything").is_cancellation());
        assert!(!StatementError::new(Some("42P01"), CANCELED_BY_USER_MESSAGE).is_cancellation());
    }

    #[test]
    fn cancellation_falls_back_to_message() {
        let e = StatementError::new(None, "ERROR: canceling statement due to user request");
        assert!(e.is_cancellation());
        assert!(!StatementError::new(None, "relation \"x\" does not exist").is_cancellation());
    }

    #[test]
    fn test_type_mapping() {
        assert_eq!(map_postgres_type("integer"), LogicalType::Int);
        assert_eq!(map_postgres_type("double precision"), LogicalType::Float);
        assert_eq!(map_postgres_type("character varying"), LogicalType::String);
        assert_eq!(map_postgres_type("bytea"), LogicalType::Bytes);
        assert_eq!(map_postgres_type("timestamp with time zone"), LogicalType::Timestamp);
        assert_eq!(map_postgres_type("jsonb"), LogicalType::Json);
        assert_eq!(
            map_postgres_type("numeric(10,2)"),
            LogicalType::Decimal { precision: Some(10), scale: Some(2) }
        );
        assert_eq!(
            map_postgres_type("_int4"),
            LogicalType::Array { element_type: Box::new(LogicalType::Int) }
        );
        assert_eq!(map_postgres_type("geometry"), LogicalType::Unknown);
    }

    #[test]
    fn column_rows_group_into_tables() {
        let rows = vec![
            row(json!({"table_name": "orders", "table_description": "All orders", "column_name": "id",
                       "data_type": "integer", "udt_name": "int4", "is_nullable": "NO",
                       "numeric_precision": 32, "numeric_scale": 0, "column_description": null})),
            row(json!({"table_name": "orders", "table_description": "All orders", "column_name": "total",
                       "data_type": "numeric", "udt_name": "numeric", "is_nullable": "YES",
                       "numeric_precision": 12, "numeric_scale": 2, "column_description": "Gross"})),
            row(json!({"table_name": "tags", "table_description": null, "column_name": "labels",
                       "data_type": "ARRAY", "udt_name": "_text", "is_nullable": "YES",
                       "numeric_precision": null, "numeric_scale": null, "column_description": null})),
            row(json!({"table_name": "empty", "table_description": null, "column_name": null})),
        ];

        let tables = group_tables(&rows);
        assert_eq!(tables.len(), 3);

        let orders = &tables[0];
        assert_eq!(orders.description.as_deref(), Some("All orders"));
        assert_eq!(orders.fields.len(), 2);
        assert_eq!(orders.fields[0].nullable, Nullability::No);
        assert_eq!(orders.fields[1].data_type, "numeric(12,2)");
        assert_eq!(orders.fields[1].description.as_deref(), Some("Gross"));

        let labels = &tables[1].fields[0];
        assert_eq!(labels.data_type, "text[]");
        assert!(labels.repeated);

        assert!(tables[2].fields.is_empty());
    }

    #[tokio::test]
    async fn connect_fails_on_bad_credentials() {
        let pool = ScriptedPool::default().refusing();
        let driver = RelationalDriver::new(pool);
        assert!(matches!(driver.connect().await, Err(DriverError::Connection(_))));
        assert!(matches!(
            driver.execute_query("SELECT 1").await,
            Err(DriverError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn session_held_until_result_consumed() {
        let pool = ScriptedPool::default().on("SELECT 1", Scripted::Rows(vec![row(json!({"x": 1}))]));
        let driver = connected(pool).await;
        assert_eq!(driver.open_sessions(), 0);

        let job_id = driver.execute_query("SELECT 1 AS x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(driver.open_sessions(), 1);

        let result = driver.get_job_result(&job_id).await.unwrap();
        assert_eq!(result.rows().map(<[Row]>::len), Some(1));
        assert_eq!(driver.open_sessions(), 0);
        assert!(driver.get_job_result(&job_id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn long_query_canceled_within_deadline() {
        let pool = ScriptedPool::default().on("pg_sleep", Scripted::Slow(Duration::from_secs(30), vec![]));
        let driver = connected(pool.clone()).await;

        let started = Instant::now();
        let job_id = driver.execute_query("SELECT pg_sleep(30)").await.unwrap();
        let pid = driver.backend_pid(&job_id).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        driver.cancel_job(&job_id).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), driver.get_job_result(&job_id))
            .await
            .expect("canceled job should resolve promptly")
            .unwrap();
        assert_eq!(result, JobResult::Canceled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(pool.state.canceled.lock().unwrap().contains(&pid));
        assert_eq!(driver.open_sessions(), 0);
    }

    #[tokio::test]
    async fn cancel_right_after_execute_skips_statement() {
        let pool = ScriptedPool::default().on("pg_sleep", Scripted::Slow(Duration::from_secs(30), vec![]));
        let driver = connected(pool.clone()).await;

        let job_id = driver.execute_query("SELECT pg_sleep(30)").await.unwrap();
        driver.cancel_job(&job_id).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), driver.get_job_result(&job_id))
            .await
            .expect("canceled job should resolve promptly")
            .unwrap();
        assert_eq!(result, JobResult::Canceled);
        assert!(pool.state.canceled.lock().unwrap().is_empty());
        assert_eq!(driver.open_sessions(), 0);
    }

    #[tokio::test]
    async fn cancel_reaching_idle_backend_is_resent() {
        let pool = ScriptedPool::default()
            .with_transit(Duration::from_millis(30))
            .on("pg_sleep", Scripted::Slow(Duration::from_secs(30), vec![]));
        let driver = connected(pool.clone()).await;

        let job_id = driver.execute_query("SELECT pg_sleep(30)").await.unwrap();
        let pid = driver.backend_pid(&job_id).unwrap();

        // Statement sent but not yet running on the server
        tokio::time::sleep(Duration::from_millis(5)).await;
        driver.cancel_job(&job_id).await.unwrap();
        assert!(pool.state.ignored_cancels.load(Ordering::SeqCst) >= 1);

        let result = tokio::time::timeout(Duration::from_secs(1), driver.get_job_result(&job_id))
            .await
            .expect("canceled job should resolve promptly")
            .unwrap();
        assert_eq!(result, JobResult::Canceled);
        assert!(pool.state.canceled.lock().unwrap().contains(&pid));
        assert_eq!(driver.open_sessions(), 0);
    }

    #[tokio::test]
    async fn statement_failure_is_a_job_error() {
        let pool = ScriptedPool::default().on(
            "missing",
            Scripted::Fail(StatementError::new(Some("42P01"), "relation \"missing\" does not exist")),
        );
        let driver = connected(pool).await;

        let job_id = driver.execute_query("SELECT * FROM missing").await.unwrap();
        assert_eq!(
            driver.get_job_result(&job_id).await.unwrap(),
            JobResult::error("relation \"missing\" does not exist")
        );
    }

    #[tokio::test]
    async fn concurrent_jobs_cancel_independently() {
        let pool = ScriptedPool::default()
            .on("slow_a", Scripted::Slow(Duration::from_secs(30), vec![]))
            .on("slow_b", Scripted::Slow(Duration::from_millis(100), vec![row(json!({"done": true}))]));
        let driver = connected(pool.clone()).await;

        let a = driver.execute_query("SELECT slow_a()").await.unwrap();
        let b = driver.execute_query("SELECT slow_b()").await.unwrap();
        assert_ne!(a, b);
        assert_ne!(driver.backend_pid(&a), driver.backend_pid(&b));

        tokio::time::sleep(Duration::from_millis(20)).await;
        driver.cancel_job(&a).await.unwrap();

        assert_eq!(driver.get_job_result(&a).await.unwrap(), JobResult::Canceled);
        let b_result = driver.get_job_result(&b).await.unwrap();
        assert_eq!(b_result.rows().map(<[Row]>::len), Some(1));
        assert_eq!(pool.state.canceled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_noop() {
        let pool = ScriptedPool::default().on("SELECT 1", Scripted::Rows(vec![]));
        let driver = connected(pool.clone()).await;

        let job_id = driver.execute_query("SELECT 1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        driver.cancel_job(&job_id).await.unwrap();

        assert_eq!(
            driver.get_job_result(&job_id).await.unwrap(),
            JobResult::Complete { rows: vec![] }
        );
        assert!(pool.state.canceled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_releases_every_session() {
        let pool = ScriptedPool::default().on("pg_sleep", Scripted::Slow(Duration::from_secs(30), vec![]));
        let driver = connected(pool).await;

        let job_id = driver.execute_query("SELECT pg_sleep(30)").await.unwrap();
        assert_eq!(driver.open_sessions(), 1);

        driver.disconnect().await.unwrap();
        wait_for_idle(&driver).await;
        assert_eq!(driver.open_sessions(), 0);
        assert!(driver.get_job_result(&job_id).await.unwrap_err().is_not_found());
        assert!(driver.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn schemas_listed_as_datasets() {
        let pool = ScriptedPool::default()
            .on("current_database()", Scripted::Rows(vec![row(json!({"database": "shop"}))]))
            .on("pg_namespace", Scripted::Rows(vec![
                row(json!({"schema_name": "public", "description": "standard public schema", "table_count": 3})),
                row(json!({"schema_name": "staging", "description": null, "table_count": 0})),
            ]));
        let driver = connected(pool).await;

        let projects = driver.fetch_projects_and_datasets().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, "shop");

        let datasets = &projects[0].datasets;
        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0].id, "public");
        assert_eq!(datasets[0].table_count, 3);
        assert!(datasets[0].tables.is_empty());
        assert_eq!(datasets[1].table_count, 0);
    }

    #[tokio::test]
    async fn tables_come_back_in_a_single_page() {
        let pool = ScriptedPool::default().on("information_schema.columns", Scripted::Rows(vec![
            row(json!({"table_name": "users", "column_name": "email", "data_type": "text",
                       "udt_name": "text", "is_nullable": "NO"})),
        ]));
        let driver = connected(pool).await;

        let page = driver.fetch_tables_for_dataset("public", None).await.unwrap();
        assert!(page.is_last());
        assert_eq!(page.tables.len(), 1);
        assert_eq!(page.tables[0].fields[0].logical_type, LogicalType::String);
        assert_eq!(driver.open_sessions(), 0);
    }
}
