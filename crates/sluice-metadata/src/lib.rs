//! Incremental metadata discovery over live connections
//!
//! Fetching a warehouse's full catalog up front is slow. This crate fetches
//! it in two phases instead:
//!
//! - **Refresh**: projects and datasets with table counts, tables left empty
//! - **Dataset load**: the tables of one dataset, one page per call
//!
//! The tree for each connection is immutable. Every change installs a new
//! [`MetadataTree`](sluice_core::MetadataTree) that shares untouched nodes
//! with the previous one.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sluice_metadata::{DatasetTables, IncrementalMetadataFetcher};
//!
//! let fetcher = IncrementalMetadataFetcher::new(registry);
//! fetcher.fetch_metadata_incremental(&connection_id).await?;
//!
//! // Expand a dataset when the user opens it
//! match fetcher.fetch_tables_for_dataset(&connection_id, "sales").await? {
//!     DatasetTables::Fetched { tables, complete } => { /* ... */ }
//!     DatasetTables::Cached(tables) => { /* ... */ }
//!     DatasetTables::InFlight => {}
//! }
//! ```

pub mod error;
pub mod fetcher;
pub mod tree;

pub use error::MetadataError;
pub use fetcher::{DatasetTables, IncrementalMetadataFetcher, RefreshOutcome};
