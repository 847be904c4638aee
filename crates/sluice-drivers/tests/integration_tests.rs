//! Integration tests for drivers and the connection registry
//!
//! Tests requiring real backends are marked with `#[ignore]` and can be run
//! with `cargo test -- --ignored`.
//!
//! ## Running Tests
//!
//! ```bash
//! # Run all non-ignored tests (no credentials required)
//! cargo test -p sluice-drivers --test integration_tests
//!
//! # Run BigQuery integration tests
//! SLUICE_BIGQUERY_KEY=/path/to/service-account.json \
//! cargo test -p sluice-drivers --features bigquery --test integration_tests -- --ignored
//!
//! # Run PostgreSQL integration tests
//! PGHOST=localhost \
//! PGPORT=5432 \
//! PGDATABASE=mydb \
//! PGUSER=user \
//! PGPASSWORD=pass \
//! cargo test -p sluice-drivers --features postgres --test integration_tests -- --ignored
//! ```

mod fixtures;

use fixtures::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use sluice_core::{DriverError, Integration, JobResult, Row, WarehouseSettings};
use sluice_drivers::warehouse::{DatasetRef, Page, RawField, RawTable, ResultsPage, VendorJob};
use sluice_drivers::{
    BackendCanceller, ConnectionRegistry, Driver, MockDriver, MockQuery, RelationalDriver,
    Session, SessionPool, StatementError, WarehouseApi, WarehouseDriver,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// Helper Functions
// =============================================================================

/// Check if BigQuery credentials are available
fn has_bigquery_credentials() -> bool {
    std::env::var("SLUICE_BIGQUERY_KEY").is_ok()
}

/// Check if PostgreSQL credentials are available
fn has_postgres_credentials() -> bool {
    std::env::var("PGHOST").is_ok()
}

fn registry_over(driver: Arc<MockDriver>) -> ConnectionRegistry {
    ConnectionRegistry::with_factory(
        move |_: &Integration| -> Result<Arc<dyn Driver>, DriverError> {
            Ok(Arc::clone(&driver) as Arc<dyn Driver>)
        },
    )
}

async fn connect(registry: &ConnectionRegistry) -> String {
    let result = registry.connect(&warehouse_integration()).await;
    assert!(result.success, "connect failed: {:?}", result.error);
    result.connection_id.unwrap()
}

// =============================================================================
// Registry Tests (MockDriver, no credentials required)
// =============================================================================

#[tokio::test]
async fn test_connect_failure_is_reported_not_raised() {
    let registry = registry_over(Arc::new(MockDriver::new().with_connection_failure()));

    let result = registry.connect(&warehouse_integration()).await;
    assert!(!result.success);
    assert_eq!(result.connection_id, None);
    assert!(result.error.is_some());

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["success"], json!(false));
    assert!(json.get("connectionId").is_none());
}

#[tokio::test]
async fn test_concurrent_jobs_cancel_independently() {
    let driver = Arc::new(
        MockDriver::new()
            .with_query("long_a", MockQuery::rows(Vec::new()).after(Duration::from_secs(30)))
            .with_query(
                "long_b",
                MockQuery::rows(vec![row(json!({"n": 1}))]).after(Duration::from_millis(100)),
            ),
    );
    let registry = registry_over(Arc::clone(&driver));
    let id = connect(&registry).await;

    let a = registry.execute_query(&id, "SELECT long_a").await.unwrap();
    let b = registry.execute_query(&id, "SELECT long_b").await.unwrap();
    assert_ne!(a, b);

    registry.cancel_job(&id, &a).await.unwrap();

    assert_eq!(registry.get_job_result(&id, &a).await.unwrap(), JobResult::Canceled);
    assert_eq!(
        registry.get_job_result(&id, &b).await.unwrap(),
        JobResult::Complete {
            rows: vec![row(json!({"n": 1}))]
        }
    );
    assert_eq!(driver.cancel_calls(), 1);
}

#[tokio::test]
async fn test_cancel_after_completion_is_noop() {
    let driver = Arc::new(MockDriver::new().with_query("SELECT 1", MockQuery::rows(vec![row(json!({"x": 1}))])));
    let registry = registry_over(Arc::clone(&driver));
    let id = connect(&registry).await;

    let job = registry.execute_query(&id, "SELECT 1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.cancel_job(&id, &job).await.unwrap();

    let result = registry.get_job_result(&id, &job).await.unwrap();
    assert_eq!(result.rows().map(<[Row]>::len), Some(1));
    assert_eq!(driver.cancel_calls(), 0);
}

#[tokio::test]
async fn test_result_consumed_once() {
    let registry = registry_over(Arc::new(MockDriver::new()));
    let id = connect(&registry).await;

    let job = registry.execute_query(&id, "SELECT 1").await.unwrap();
    registry.get_job_result(&id, &job).await.unwrap();

    let second = registry.get_job_result(&id, &job).await;
    assert!(matches!(second, Err(DriverError::JobNotFound(_))));
    assert!(matches!(
        registry.cancel_job(&id, &job).await,
        Err(DriverError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_connect_disconnect_leaves_nothing_open() {
    let driver = Arc::new(
        MockDriver::new().with_query("forever", MockQuery::rows(Vec::new()).after(Duration::from_secs(60))),
    );
    let registry = registry_over(Arc::clone(&driver));
    let id = connect(&registry).await;

    registry.execute_query(&id, "SELECT forever").await.unwrap();
    let done = registry.execute_query(&id, "SELECT 1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(driver.open_resources() >= 2);

    registry.disconnect(&id).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    while driver.open_resources() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(driver.open_resources(), 0);
    assert!(registry.get_job_result(&id, &done).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_catalog_through_registry() {
    let driver = Arc::new(
        MockDriver::new()
            .with_projects(vec![analytics_project()])
            .with_tables("sales", vec![users_table(), orders_table(), events_table()]),
    );
    let registry = registry_over(driver);
    let id = connect(&registry).await;

    let projects = registry.fetch_projects_and_datasets(&id).await.unwrap();
    assert_eq!(projects[0].datasets.len(), 2);
    assert!(projects[0].datasets.iter().all(|d| d.tables.is_empty()));

    let page = registry.fetch_tables_for_dataset(&id, "sales", None).await.unwrap();
    assert_eq!(page.tables.len(), 3);
    assert_eq!(page.tables[1].fields[2].fields.len(), 2);
    assert!(page.is_last());
}

// =============================================================================
// Prompt execute_query on both adapters
// =============================================================================

/// Vendor whose jobs take ten seconds to finish
struct SlowWarehouse;

#[async_trait::async_trait]
impl WarehouseApi for SlowWarehouse {
    fn project_id(&self) -> &str {
        "slow"
    }

    async fn open(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn close(&self) {}

    async fn list_datasets(&self, _: u32, _: Option<String>) -> Result<Page<DatasetRef>, DriverError> {
        Ok(Page { items: Vec::new(), next_page_token: None })
    }

    async fn count_tables(&self, _: &str) -> Result<u64, DriverError> {
        Ok(0)
    }

    async fn list_tables(&self, _: &str, _: u32, _: Option<String>) -> Result<Page<String>, DriverError> {
        Ok(Page { items: Vec::new(), next_page_token: None })
    }

    async fn get_table(&self, _: &str, table_id: &str) -> Result<RawTable, DriverError> {
        Err(DriverError::Catalog(format!("Not found: {}", table_id)))
    }

    async fn insert_query_job(&self, _: &str) -> Result<VendorJob, String> {
        Ok(VendorJob { job_id: "slow-job".to_string(), location: None })
    }

    async fn query_results(&self, _: &VendorJob, _: Option<String>) -> Result<ResultsPage, String> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(ResultsPage {
            complete: true,
            schema: vec![RawField::new("x", "INTEGER")],
            rows: vec![vec![json!({"v": "1"})]],
            next_page_token: None,
        })
    }

    async fn cancel_job(&self, _: &VendorJob) -> Result<(), DriverError> {
        Ok(())
    }
}

#[derive(Clone)]
struct NoopCanceller;

#[async_trait::async_trait]
impl BackendCanceller for NoopCanceller {
    async fn cancel(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

struct SlowSession;

#[async_trait::async_trait]
impl Session for SlowSession {
    type Canceller = NoopCanceller;

    async fn backend_pid(&mut self) -> Result<i32, StatementError> {
        Ok(4242)
    }

    fn canceller(&self) -> NoopCanceller {
        NoopCanceller
    }

    async fn query(&mut self, _: &str, _: &[&str]) -> Result<Vec<Row>, StatementError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct SlowPool {
    open: AtomicBool,
}

#[async_trait::async_trait]
impl SessionPool for SlowPool {
    type Session = SlowSession;

    async fn open(&self) -> Result<(), DriverError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn acquire(&self) -> Result<SlowSession, DriverError> {
        Ok(SlowSession)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn checked_out(&self) -> usize {
        0
    }
}

#[tokio::test]
async fn test_execute_returns_promptly_on_both_adapters() {
    let warehouse = WarehouseDriver::new(Arc::new(SlowWarehouse), WarehouseSettings::default());
    let relational = RelationalDriver::new(SlowPool::default());
    let drivers: [&dyn Driver; 2] = [&warehouse, &relational];

    for driver in drivers {
        driver.connect().await.unwrap();

        let started = Instant::now();
        let job = driver.execute_query("SELECT 1").await.unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "{} blocked in execute_query",
            driver.name()
        );

        driver.cancel_job(&job).await.unwrap();
        driver.disconnect().await.unwrap();
    }
}

// =============================================================================
// Real backend tests (require credentials)
// =============================================================================

#[tokio::test]
#[ignore] // Run with: cargo test --features bigquery -- --ignored
async fn test_bigquery_query_roundtrip() {
    if !has_bigquery_credentials() {
        eprintln!("Skipping BigQuery test: set SLUICE_BIGQUERY_KEY");
        return;
    }

    #[cfg(feature = "bigquery")]
    {
        use sluice_core::{BackendCredentials, WarehouseCredentials};

        let path = std::env::var("SLUICE_BIGQUERY_KEY").unwrap();
        let key: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).expect("key file readable"))
                .expect("key file is JSON");
        let integration = Integration::new(
            "bq",
            "BigQuery",
            BackendCredentials::Warehouse(WarehouseCredentials {
                project_id: None,
                service_account: key,
            }),
        );

        let registry = ConnectionRegistry::new(&sluice_core::Config::default());
        let result = registry.connect(&integration).await;
        let id = result.connection_id.expect("BigQuery connect failed");

        let job = registry.execute_query(&id, "SELECT 1 AS one").await.unwrap();
        let outcome = registry.get_job_result(&id, &job).await.unwrap();
        assert_eq!(outcome, JobResult::Complete { rows: vec![row(json!({"one": 1}))] });

        registry.disconnect_all().await;
    }

    #[cfg(not(feature = "bigquery"))]
    {
        eprintln!("BigQuery feature not enabled. Rebuild with --features bigquery");
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test --features postgres -- --ignored
async fn test_postgres_cancel_long_query() {
    if !has_postgres_credentials() {
        eprintln!("Skipping PostgreSQL test: set PGHOST, PGDATABASE, PGUSER, PGPASSWORD");
        return;
    }

    #[cfg(feature = "postgres")]
    {
        use sluice_core::{BackendCredentials, RelationalCredentials};

        let integration = Integration::new(
            "pg",
            "PostgreSQL",
            BackendCredentials::Relational(RelationalCredentials {
                host: std::env::var("PGHOST").unwrap(),
                port: std::env::var("PGPORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(5432),
                database: std::env::var("PGDATABASE").unwrap_or_else(|_| "postgres".to_string()),
                user: std::env::var("PGUSER").unwrap_or_else(|_| "postgres".to_string()),
                password: std::env::var("PGPASSWORD").unwrap_or_default(),
                ssl: false,
            }),
        );

        let registry = ConnectionRegistry::new(&sluice_core::Config::default());
        let id = registry
            .connect(&integration)
            .await
            .connection_id
            .expect("PostgreSQL connect failed");

        let job = registry.execute_query(&id, "SELECT pg_sleep(30)").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.cancel_job(&id, &job).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), registry.get_job_result(&id, &job))
            .await
            .expect("cancel did not land within a second")
            .unwrap();
        assert_eq!(outcome, JobResult::Canceled);

        let projects = registry.fetch_projects_and_datasets(&id).await.unwrap();
        assert!(projects[0].datasets.iter().any(|d| d.id == "public"));

        registry.disconnect(&id).await.unwrap();
    }

    #[cfg(not(feature = "postgres"))]
    {
        eprintln!("PostgreSQL feature not enabled. Rebuild with --features postgres");
    }
}
