//! `WarehouseApi` over `gcp-bigquery-client`
//!
//! Requires these IAM permissions on the project:
//! - bigquery.jobs.create
//! - bigquery.datasets.get
//! - bigquery.tables.list / bigquery.tables.get
//!
//! Reference: https://cloud.google.com/bigquery/docs/reference/rest

use crate::warehouse::{DatasetRef, Page, RawField, RawTable, ResultsPage, VendorJob, WarehouseApi};
use gcp_bigquery_client::model::get_query_results_parameters::GetQueryResultsParameters;
use gcp_bigquery_client::model::job::Job;
use gcp_bigquery_client::model::job_configuration::JobConfiguration;
use gcp_bigquery_client::model::job_configuration_query::JobConfigurationQuery;
use gcp_bigquery_client::model::table_field_schema::TableFieldSchema;
use gcp_bigquery_client::Client as BigQueryClient;
use serde_json::Value;
use sluice_core::{DriverError, WarehouseCredentials};
use tokio::sync::RwLock;

/// Server-side wait per results poll
const RESULTS_WAIT_MS: i32 = 10_000;

/// BigQuery REST client bound to one project
pub struct BigQueryApi {
    project_id: String,
    service_account: Value,
    client: RwLock<Option<BigQueryClient>>,
}

impl BigQueryApi {
    /// Prepare a client from service account credentials; nothing is
    /// contacted until `open`.
    pub fn from_credentials(credentials: &WarehouseCredentials) -> Result<Self, DriverError> {
        let project_id = credentials.resolved_project_id().ok_or_else(|| {
            DriverError::Config("service account key has no project_id".to_string())
        })?;

        Ok(Self {
            project_id,
            service_account: credentials.normalized_key(),
            client: RwLock::new(None),
        })
    }

    async fn client(&self) -> Result<BigQueryClient, DriverError> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| DriverError::Connection("BigQuery client is not open".to_string()))
    }
}

fn catalog_error(context: &str, e: impl std::fmt::Display) -> DriverError {
    let message = e.to_string();
    if message.contains("Access Denied") || message.contains("Permission") {
        DriverError::Connection(format!("{}: {}", context, message))
    } else {
        DriverError::Catalog(format!("{}: {}", context, message))
    }
}

fn raw_field(schema: &TableFieldSchema) -> RawField {
    // FieldType serializes to the REST spelling (INTEGER, RECORD, ...)
    let field_type = serde_json::to_value(&schema.r#type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "UNKNOWN".to_string());

    RawField {
        name: schema.name.clone(),
        field_type,
        mode: schema.mode.clone(),
        description: schema.description.clone(),
        fields: schema
            .fields
            .as_ref()
            .map(|fields| fields.iter().map(raw_field).collect())
            .unwrap_or_default(),
    }
}

#[async_trait::async_trait]
impl WarehouseApi for BigQueryApi {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn open(&self) -> Result<(), DriverError> {
        let sa_key: gcp_bigquery_client::yup_oauth2::ServiceAccountKey =
            serde_json::from_value(self.service_account.clone())
                .map_err(|e| DriverError::Connection(format!(
                    "Failed to parse service account JSON: {}",
                    e
                )))?;

        let client = BigQueryClient::from_service_account_key(sa_key, false)
            .await
            .map_err(|e| DriverError::Connection(format!(
                "Failed to authenticate with service account: {}",
                e
            )))?;

        *self.client.write().await = Some(client);
        Ok(())
    }

    async fn close(&self) {
        self.client.write().await.take();
    }

    async fn list_datasets(
        &self,
        page_size: u32,
        page_token: Option<String>,
    ) -> Result<Page<DatasetRef>, DriverError> {
        let client = self.client().await?;
        let mut options = gcp_bigquery_client::dataset::ListOptions::default().max_results(page_size as u64);
        if let Some(token) = page_token {
            options = options.page_token(token);
        }

        let list = client
            .dataset()
            .list(&self.project_id, options)
            .await
            .map_err(|e| catalog_error("list datasets", e))?;

        Ok(Page {
            items: list
                .datasets
                .into_iter()
                .map(|d| DatasetRef {
                    id: d.dataset_reference.dataset_id,
                    friendly_name: d.friendly_name,
                })
                .collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn count_tables(&self, dataset_id: &str) -> Result<u64, DriverError> {
        let client = self.client().await?;
        let options = gcp_bigquery_client::table::ListOptions::default().max_results(1);

        let list = client
            .table()
            .list(&self.project_id, dataset_id, options)
            .await
            .map_err(|e| catalog_error("count tables", e))?;

        Ok(list.total_items.map(|n| n.max(0) as u64).unwrap_or_else(|| {
            list.tables.map_or(0, |t| t.len() as u64)
        }))
    }

    async fn list_tables(
        &self,
        dataset_id: &str,
        page_size: u32,
        page_token: Option<String>,
    ) -> Result<Page<String>, DriverError> {
        let client = self.client().await?;
        let mut options = gcp_bigquery_client::table::ListOptions::default().max_results(page_size as u64);
        if let Some(token) = page_token {
            options = options.page_token(token);
        }

        let list = client
            .table()
            .list(&self.project_id, dataset_id, options)
            .await
            .map_err(|e| catalog_error("list tables", e))?;

        Ok(Page {
            items: list
                .tables
                .unwrap_or_default()
                .into_iter()
                .map(|t| t.table_reference.table_id)
                .collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn get_table(&self, dataset_id: &str, table_id: &str) -> Result<RawTable, DriverError> {
        let client = self.client().await?;
        let table = client
            .table()
            .get(&self.project_id, dataset_id, table_id, None)
            .await
            .map_err(|e| catalog_error(&format!("get table {}.{}", dataset_id, table_id), e))?;

        Ok(RawTable {
            id: table_id.to_string(),
            friendly_name: table.friendly_name,
            description: table.description,
            fields: table
                .schema
                .fields
                .as_ref()
                .map(|fields| fields.iter().map(raw_field).collect())
                .unwrap_or_default(),
        })
    }

    async fn insert_query_job(&self, sql: &str) -> Result<VendorJob, String> {
        let client = self.client().await.map_err(|e| e.to_string())?;

        let job = Job {
            configuration: Some(JobConfiguration {
                query: Some(JobConfigurationQuery {
                    query: sql.to_string(),
                    use_legacy_sql: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let inserted = client
            .job()
            .insert(&self.project_id, job)
            .await
            .map_err(|e| e.to_string())?;

        let reference = inserted
            .job_reference
            .ok_or_else(|| "BigQuery returned a job without a reference".to_string())?;
        let job_id = reference
            .job_id
            .ok_or_else(|| "BigQuery returned a job without an id".to_string())?;

        Ok(VendorJob {
            job_id,
            location: reference.location,
        })
    }

    async fn query_results(
        &self,
        job: &VendorJob,
        page_token: Option<String>,
    ) -> Result<ResultsPage, String> {
        let client = self.client().await.map_err(|e| e.to_string())?;

        let parameters = GetQueryResultsParameters {
            location: job.location.clone(),
            page_token,
            timeout_ms: Some(RESULTS_WAIT_MS),
            ..Default::default()
        };

        let response = client
            .job()
            .get_query_results(&self.project_id, &job.job_id, parameters)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(errors) = response.errors.as_ref().filter(|errors| !errors.is_empty()) {
            let message = errors
                .iter()
                .filter_map(|e| e.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(message);
        }

        if !response.job_complete.unwrap_or(false) {
            return Ok(ResultsPage::default());
        }

        let schema = response
            .schema
            .as_ref()
            .and_then(|s| s.fields.as_ref())
            .map(|fields| fields.iter().map(raw_field).collect())
            .unwrap_or_default();

        let rows = response
            .rows
            .unwrap_or_default()
            .into_iter()
            .map(|row| {
                row.columns
                    .unwrap_or_default()
                    .into_iter()
                    .map(|cell| cell.value.unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Ok(ResultsPage {
            complete: true,
            schema,
            rows,
            next_page_token: response.page_token,
        })
    }

    async fn cancel_job(&self, job: &VendorJob) -> Result<(), DriverError> {
        let client = self.client().await?;
        client
            .job()
            .cancel_job(&self.project_id, &job.job_id, job.location.as_deref())
            .await
            .map_err(|e| DriverError::Catalog(format!("cancel job {}: {}", job.job_id, e)))?;
        Ok(())
    }
}
