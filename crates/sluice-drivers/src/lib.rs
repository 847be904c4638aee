//! Backend drivers behind one connect / execute / cancel / catalog contract
//!
//! Query execution is asynchronous: `execute_query` hands back a job id as
//! soon as the backend accepted the statement, and the result is collected
//! later with `get_job_result`.
//!
//! ## Features
//!
//! Enable backend support via Cargo features:
//! - `bigquery` - Google BigQuery (warehouse)
//! - `postgres` - PostgreSQL/Redshift (relational)
//! - `all-backends` - Both
//!
//! Without a feature the driver logic still compiles; creating a driver for
//! that backend fails with `DriverError::Unsupported`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sluice_drivers::ConnectionRegistry;
//!
//! let registry = ConnectionRegistry::new(&config);
//! let connected = registry.connect(&integration).await;
//! let connection_id = connected.connection_id.unwrap();
//!
//! let job = registry.execute_query(&connection_id, "SELECT 1").await?;
//! let result = registry.get_job_result(&connection_id, &job).await?;
//! ```

pub mod driver;
pub mod jobs;
pub mod mock;
pub mod postgres;
pub mod registry;
pub mod relational;
pub mod warehouse;

#[cfg(feature = "bigquery")]
pub mod bigquery;

pub use driver::Driver;
pub use jobs::{CancelSignal, JobTable};
pub use mock::{MockDriver, MockQuery};
pub use registry::{BackendDriverFactory, ConnectResult, ConnectionRegistry, DriverFactory};
pub use relational::{
    map_postgres_type, BackendCanceller, RelationalDriver, Session, SessionPool, StatementError,
};
pub use warehouse::{WarehouseApi, WarehouseDriver};

#[cfg(feature = "bigquery")]
pub use bigquery::BigQueryApi;

#[cfg(feature = "postgres")]
pub use postgres::PgSessionPool;
