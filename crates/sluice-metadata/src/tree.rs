//! Pure rewrites of the metadata tree
//!
//! Every function returns a new tree. Nodes off the rewritten path are the
//! same `Arc`s as in the input, so readers holding the old tree never see a
//! change.

use sluice_core::{Dataset, MetadataTree, Project, Table};
use std::sync::Arc;

/// Rebuild the path to one dataset. `None` if the dataset is absent or
/// `rewrite` declines.
fn rewrite_dataset<F>(tree: &MetadataTree, dataset_id: &str, rewrite: F) -> Option<MetadataTree>
where
    F: FnOnce(&Dataset) -> Option<Dataset>,
{
    let (project_idx, dataset_idx) = tree.projects.iter().enumerate().find_map(|(p, project)| {
        project
            .datasets
            .iter()
            .position(|dataset| dataset.id == dataset_id)
            .map(|d| (p, d))
    })?;

    let dataset = rewrite(&tree.projects[project_idx].datasets[dataset_idx])?;

    let mut project = Project::clone(&tree.projects[project_idx]);
    project.datasets[dataset_idx] = Arc::new(dataset);

    let mut projects = tree.projects.clone();
    projects[project_idx] = Arc::new(project);
    Some(MetadataTree { projects })
}

/// Set a dataset's tables, dropping whatever it held
pub fn replace_tables(tree: &MetadataTree, dataset_id: &str, tables: Vec<Table>) -> Option<MetadataTree> {
    rewrite_dataset(tree, dataset_id, |dataset| {
        let mut dataset = dataset.clone();
        dataset.tables = tables.into_iter().map(Arc::new).collect();
        Some(dataset)
    })
}

/// Add a further page of tables to a dataset. A table id already present
/// keeps its existing node.
pub fn append_tables(tree: &MetadataTree, dataset_id: &str, tables: Vec<Table>) -> Option<MetadataTree> {
    rewrite_dataset(tree, dataset_id, |dataset| {
        let mut dataset = dataset.clone();
        for table in tables {
            if dataset.find_table(&table.id).is_none() {
                dataset.tables.push(Arc::new(table));
            }
        }
        Some(dataset)
    })
}

/// Flip `included_in_ai_context` on one table
pub fn set_table_included(
    tree: &MetadataTree,
    dataset_id: &str,
    table_id: &str,
    included: bool,
) -> Option<MetadataTree> {
    rewrite_dataset(tree, dataset_id, |dataset| {
        let idx = dataset.tables.iter().position(|t| t.id == table_id)?;
        let mut dataset = dataset.clone();
        let mut table = Table::clone(&dataset.tables[idx]);
        table.included_in_ai_context = included;
        dataset.tables[idx] = Arc::new(table);
        Some(dataset)
    })
}
