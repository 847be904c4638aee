//! Two-phase metadata discovery per connection
//!
//! Phase one lists projects and datasets with table counts. Phase two loads
//! the tables of one dataset on demand. Repeat and concurrent requests for a
//! dataset are answered from the tree without touching the backend, and a
//! dataset whose pages have not all been read resumes from the stored
//! continuation token.

use crate::error::MetadataError;
use crate::tree;
use sluice_core::{MetadataTree, Table};
use sluice_drivers::ConnectionRegistry;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Result of [`IncrementalMetadataFetcher::fetch_metadata_incremental`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new tree was installed
    Refreshed { datasets: usize },

    /// Another refresh for the connection is still running
    AlreadyInFlight,
}

/// Result of [`IncrementalMetadataFetcher::fetch_tables_for_dataset`]
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetTables {
    /// Already loaded; no backend call was made
    Cached(Vec<Arc<Table>>),

    /// Another call is loading this dataset; no backend call was made
    InFlight,

    /// One page was fetched and merged. `complete` is false while pages
    /// remain; the next call resumes from there.
    Fetched {
        tables: Vec<Arc<Table>>,
        complete: bool,
    },
}

#[derive(Debug, Default)]
struct ConnectionState {
    tree: Option<Arc<MetadataTree>>,
    fetching: bool,
    loading_datasets: BTreeSet<String>,
    loaded_datasets: BTreeSet<String>,
    page_tokens: HashMap<String, String>,
    last_error: Option<String>,
    /// Bumped by every refresh; stale dataset loads are discarded
    generation: u64,
}

type States = Mutex<HashMap<String, ConnectionState>>;

fn lock(states: &States) -> MutexGuard<'_, HashMap<String, ConnectionState>> {
    states.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears an in-flight marker however the owning call ends, dropped
/// futures included
struct InFlight<'a> {
    states: &'a States,
    connection_id: &'a str,
    dataset_id: Option<&'a str>,
    generation: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut states = lock(self.states);
        let Some(state) = states.get_mut(self.connection_id) else {
            return;
        };
        match self.dataset_id {
            None => state.fetching = false,
            Some(dataset_id) if state.generation == self.generation => {
                state.loading_datasets.remove(dataset_id);
            }
            Some(_) => {}
        }
    }
}

/// Metadata store over the connection registry
pub struct IncrementalMetadataFetcher {
    registry: Arc<ConnectionRegistry>,
    states: States,
}

impl IncrementalMetadataFetcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// List projects and datasets, replacing whatever was known for the
    /// connection. Dataset tables start empty.
    pub async fn fetch_metadata_incremental(
        &self,
        connection_id: &str,
    ) -> Result<RefreshOutcome, MetadataError> {
        // State is only kept for connections the registry knows
        self.registry.driver(connection_id).await?;

        let generation = {
            let mut states = lock(&self.states);
            let state = states.entry(connection_id.to_string()).or_default();
            if state.fetching {
                tracing::debug!(connection_id, "refresh already in flight");
                return Ok(RefreshOutcome::AlreadyInFlight);
            }

            state.fetching = true;
            state.generation += 1;
            state.tree = None;
            state.loading_datasets.clear();
            state.loaded_datasets.clear();
            state.page_tokens.clear();
            state.last_error = None;
            state.generation
        };
        let _in_flight = InFlight {
            states: &self.states,
            connection_id,
            dataset_id: None,
            generation,
        };

        let fetched = self.registry.fetch_projects_and_datasets(connection_id).await;

        let mut states = lock(&self.states);
        let state = states.entry(connection_id.to_string()).or_default();
        match fetched {
            Ok(projects) => {
                let tree = MetadataTree::from_projects(projects);
                let datasets = tree.dataset_count();
                state.tree = Some(Arc::new(tree));
                tracing::info!(connection_id, datasets, "metadata refreshed");
                Ok(RefreshOutcome::Refreshed { datasets })
            }
            Err(e) => {
                tracing::warn!(connection_id, error = %e, "metadata refresh failed");
                state.last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Load the next page of a dataset's tables into the tree
    pub async fn fetch_tables_for_dataset(
        &self,
        connection_id: &str,
        dataset_id: &str,
    ) -> Result<DatasetTables, MetadataError> {
        let (generation, page_token, resuming) = {
            let mut states = lock(&self.states);
            let state = states
                .get_mut(connection_id)
                .ok_or_else(|| MetadataError::NotFetched(connection_id.to_string()))?;
            let tree = state
                .tree
                .as_ref()
                .ok_or_else(|| MetadataError::NotFetched(connection_id.to_string()))?;
            let dataset = tree
                .find_dataset(dataset_id)
                .ok_or_else(|| MetadataError::DatasetNotFound(dataset_id.to_string()))?;

            if state.loaded_datasets.contains(dataset_id) {
                return Ok(DatasetTables::Cached(dataset.tables.clone()));
            }
            if state.loading_datasets.contains(dataset_id) {
                return Ok(DatasetTables::InFlight);
            }

            state.loading_datasets.insert(dataset_id.to_string());
            let page_token = state.page_tokens.get(dataset_id).cloned();
            let resuming = page_token.is_some();
            (state.generation, page_token, resuming)
        };
        let _in_flight = InFlight {
            states: &self.states,
            connection_id,
            dataset_id: Some(dataset_id),
            generation,
        };

        tracing::debug!(connection_id, dataset = dataset_id, resuming, "loading tables");
        let fetched = self
            .registry
            .fetch_tables_for_dataset(connection_id, dataset_id, page_token.as_deref())
            .await;

        let mut states = lock(&self.states);
        let state = states
            .get_mut(connection_id)
            .filter(|state| state.generation == generation)
            .ok_or_else(|| MetadataError::NotFetched(connection_id.to_string()))?;

        let page = match fetched {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(connection_id, dataset = dataset_id, error = %e, "table fetch failed");
                state.last_error = Some(e.to_string());
                return Err(e.into());
            }
        };

        let current = state
            .tree
            .as_deref()
            .ok_or_else(|| MetadataError::NotFetched(connection_id.to_string()))?;
        let merged = if resuming {
            tree::append_tables(current, dataset_id, page.tables)
        } else {
            tree::replace_tables(current, dataset_id, page.tables)
        }
        .ok_or_else(|| MetadataError::DatasetNotFound(dataset_id.to_string()))?;

        let tables = merged
            .find_dataset(dataset_id)
            .map(|dataset| dataset.tables.clone())
            .unwrap_or_default();
        state.tree = Some(Arc::new(merged));

        let complete = match page.next_page_token {
            Some(token) => {
                state.page_tokens.insert(dataset_id.to_string(), token);
                false
            }
            None => {
                state.page_tokens.remove(dataset_id);
                state.loaded_datasets.insert(dataset_id.to_string());
                true
            }
        };
        tracing::debug!(connection_id, dataset = dataset_id, tables = tables.len(), complete, "tables merged");

        Ok(DatasetTables::Fetched { tables, complete })
    }

    /// Mark whether a table is exposed to AI context
    pub fn set_table_included_in_ai_context(
        &self,
        connection_id: &str,
        dataset_id: &str,
        table_id: &str,
        included: bool,
    ) -> Result<(), MetadataError> {
        let mut states = lock(&self.states);
        let state = states
            .get_mut(connection_id)
            .ok_or_else(|| MetadataError::NotFetched(connection_id.to_string()))?;
        let current = state
            .tree
            .as_deref()
            .ok_or_else(|| MetadataError::NotFetched(connection_id.to_string()))?;

        if current.find_dataset(dataset_id).is_none() {
            return Err(MetadataError::DatasetNotFound(dataset_id.to_string()));
        }
        let updated = tree::set_table_included(current, dataset_id, table_id, included).ok_or_else(|| {
            MetadataError::TableNotFound {
                dataset_id: dataset_id.to_string(),
                table_id: table_id.to_string(),
            }
        })?;

        state.tree = Some(Arc::new(updated));
        Ok(())
    }

    /// Current tree snapshot
    pub fn tree(&self, connection_id: &str) -> Option<Arc<MetadataTree>> {
        lock(&self.states).get(connection_id).and_then(|s| s.tree.clone())
    }

    pub fn is_fetching(&self, connection_id: &str) -> bool {
        lock(&self.states).get(connection_id).is_some_and(|s| s.fetching)
    }

    pub fn is_dataset_loading(&self, connection_id: &str, dataset_id: &str) -> bool {
        lock(&self.states)
            .get(connection_id)
            .is_some_and(|s| s.loading_datasets.contains(dataset_id))
    }

    pub fn is_dataset_loaded(&self, connection_id: &str, dataset_id: &str) -> bool {
        lock(&self.states)
            .get(connection_id)
            .is_some_and(|s| s.loaded_datasets.contains(dataset_id))
    }

    /// Fully loaded datasets, sorted
    pub fn loaded_datasets(&self, connection_id: &str) -> Vec<String> {
        lock(&self.states)
            .get(connection_id)
            .map(|s| s.loaded_datasets.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Message of the most recent failed fetch
    pub fn last_error(&self, connection_id: &str) -> Option<String> {
        lock(&self.states).get(connection_id).and_then(|s| s.last_error.clone())
    }

    /// Drop everything known about a connection
    pub fn forget(&self, connection_id: &str) {
        lock(&self.states).remove(connection_id);
    }
}
