//! Connection registry
//!
//! Owns every live driver. Callers hold only the connection id returned by
//! [`ConnectionRegistry::connect`] and reach the driver through the proxy
//! methods, which fail with `DriverError::ConnectionNotFound` for ids that
//! were never issued or have been disconnected.

use crate::driver::Driver;
use crate::warehouse::WarehouseDriver;
use serde::{Deserialize, Serialize};
use sluice_core::{
    BackendCredentials, BackendType, Config, DriverError, Integration, JobId, JobResult, Project,
    RelationalSettings, TablePage, WarehouseSettings,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Builds an unconnected driver for an integration
pub trait DriverFactory: Send + Sync {
    fn create(&self, integration: &Integration) -> Result<Arc<dyn Driver>, DriverError>;
}

impl<F> DriverFactory for F
where
    F: Fn(&Integration) -> Result<Arc<dyn Driver>, DriverError> + Send + Sync,
{
    fn create(&self, integration: &Integration) -> Result<Arc<dyn Driver>, DriverError> {
        self(integration)
    }
}

/// Default factory: BigQuery for warehouse credentials, PostgreSQL for
/// relational ones
#[derive(Debug, Clone, Default)]
pub struct BackendDriverFactory {
    warehouse: WarehouseSettings,
    relational: RelationalSettings,
}

impl BackendDriverFactory {
    pub fn new(config: &Config) -> Self {
        Self {
            warehouse: config.warehouse.clone(),
            relational: config.relational.clone(),
        }
    }
}

impl DriverFactory for BackendDriverFactory {
    fn create(&self, integration: &Integration) -> Result<Arc<dyn Driver>, DriverError> {
        match &integration.credentials {
            BackendCredentials::Warehouse(credentials) => Ok(Arc::new(
                WarehouseDriver::from_credentials(credentials, self.warehouse.clone())?,
            )),
            BackendCredentials::Relational(credentials) => {
                crate::postgres::relational_driver(credentials, &self.relational)
            }
        }
    }
}

/// Outcome of [`ConnectionRegistry::connect`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectResult {
    pub fn connected(connection_id: impl Into<String>) -> Self {
        Self {
            success: true,
            connection_id: Some(connection_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            connection_id: None,
            error: Some(error.into()),
        }
    }
}

/// Live connections keyed by generated id
pub struct ConnectionRegistry {
    factory: Box<dyn DriverFactory>,
    connections: RwLock<HashMap<String, Arc<dyn Driver>>>,
    result_timeout: Option<Duration>,
}

impl ConnectionRegistry {
    /// Registry building real backend drivers from `config`
    pub fn new(config: &Config) -> Self {
        Self::with_factory(BackendDriverFactory::new(config))
            .with_result_timeout(config.jobs.result_timeout())
    }

    /// Registry building drivers with a custom factory
    pub fn with_factory(factory: impl DriverFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            connections: RwLock::new(HashMap::new()),
            result_timeout: None,
        }
    }

    /// Bound how long `get_job_result` waits. The job stays unconsumed when
    /// the bound is hit.
    pub fn with_result_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.result_timeout = timeout;
        self
    }

    /// Build and connect a driver for `integration`.
    ///
    /// Never fails: errors are reported through the returned value.
    pub async fn connect(&self, integration: &Integration) -> ConnectResult {
        let driver = match self.factory.create(integration) {
            Ok(driver) => driver,
            Err(e) => {
                tracing::warn!(integration = %integration.id, error = %e, "failed to create driver");
                return ConnectResult::failed(e.to_string());
            }
        };

        if let Err(e) = driver.connect().await {
            tracing::warn!(
                integration = %integration.id,
                backend = %driver.backend_type(),
                error = %e,
                "connect failed"
            );
            return ConnectResult::failed(e.to_string());
        }

        let connection_id = {
            let mut connections = self.connections.write().await;
            let mut id = uuid::Uuid::new_v4().to_string();
            while connections.contains_key(&id) {
                id = uuid::Uuid::new_v4().to_string();
            }
            connections.insert(id.clone(), Arc::clone(&driver));
            id
        };

        tracing::info!(
            connection_id = %connection_id,
            integration = %integration.id,
            driver = driver.name(),
            "connected"
        );
        ConnectResult::connected(connection_id)
    }

    /// Tear down one connection
    pub async fn disconnect(&self, connection_id: &str) -> Result<(), DriverError> {
        let driver = self
            .connections
            .write()
            .await
            .remove(connection_id)
            .ok_or_else(|| DriverError::ConnectionNotFound(connection_id.to_string()))?;

        driver.disconnect().await?;
        tracing::info!(connection_id, "disconnected");
        Ok(())
    }

    /// Tear down every connection; returns how many were open
    pub async fn disconnect_all(&self) -> usize {
        let drained: Vec<(String, Arc<dyn Driver>)> =
            self.connections.write().await.drain().collect();

        let count = drained.len();
        for (connection_id, driver) in drained {
            if let Err(e) = driver.disconnect().await {
                tracing::warn!(connection_id = %connection_id, error = %e, "disconnect failed");
            }
        }
        tracing::info!(count, "all connections closed");
        count
    }

    /// Driver behind a connection id
    pub async fn driver(&self, connection_id: &str) -> Result<Arc<dyn Driver>, DriverError> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| DriverError::ConnectionNotFound(connection_id.to_string()))
    }

    /// Ids of every live connection, sorted
    pub async fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn backend_type(&self, connection_id: &str) -> Option<BackendType> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|driver| driver.backend_type())
    }

    pub async fn execute_query(&self, connection_id: &str, sql: &str) -> Result<JobId, DriverError> {
        self.driver(connection_id).await?.execute_query(sql).await
    }

    pub async fn cancel_job(&self, connection_id: &str, job_id: &JobId) -> Result<(), DriverError> {
        self.driver(connection_id).await?.cancel_job(job_id).await
    }

    pub async fn get_job_result(
        &self,
        connection_id: &str,
        job_id: &JobId,
    ) -> Result<JobResult, DriverError> {
        let driver = self.driver(connection_id).await?;
        match self.result_timeout {
            None => driver.get_job_result(job_id).await,
            Some(limit) => tokio::time::timeout(limit, driver.get_job_result(job_id))
                .await
                .map_err(|_| {
                    DriverError::Timeout(format!(
                        "job {} did not finish within {}ms",
                        job_id,
                        limit.as_millis()
                    ))
                })?,
        }
    }

    pub async fn fetch_projects_and_datasets(
        &self,
        connection_id: &str,
    ) -> Result<Vec<Project>, DriverError> {
        self.driver(connection_id).await?.fetch_projects_and_datasets().await
    }

    pub async fn fetch_tables_for_dataset(
        &self,
        connection_id: &str,
        dataset_id: &str,
        page_token: Option<&str>,
    ) -> Result<TablePage, DriverError> {
        self.driver(connection_id)
            .await?
            .fetch_tables_for_dataset(dataset_id, page_token)
            .await
    }
}
