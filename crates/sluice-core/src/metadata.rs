//! Catalog metadata tree and the portable type system
//!
//! The tree is `Project -> Dataset -> Table -> Field`. Interior nodes hold
//! their children behind `Arc` so a rewrite can build a new tree that shares
//! every branch it did not touch.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Portable logical type system
///
/// Maps backend-specific column types to a common representation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogicalType {
    /// Boolean type
    Bool,

    /// Integer type (any precision)
    Int,

    /// Floating point (any precision)
    Float,

    /// Decimal with precision and scale
    Decimal {
        precision: Option<u16>,
        scale: Option<u16>,
    },

    /// String/text type
    String,

    /// Raw bytes
    Bytes,

    /// Date (no time component)
    Date,

    /// Timestamp (with time component)
    Timestamp,

    /// JSON/Variant type
    Json,

    /// Record type; its members live in `Field::fields`
    Struct,

    /// Array type
    Array {
        element_type: Box<LogicalType>,
    },

    /// Unknown type (cannot infer)
    Unknown,
}

impl std::fmt::Display for LogicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool => write!(f, "BOOL"),
            Self::Int => write!(f, "INT"),
            Self::Float => write!(f, "FLOAT"),
            Self::Decimal { precision, scale } => {
                match (precision, scale) {
                    (Some(p), Some(s)) => write!(f, "DECIMAL({}, {})", p, s),
                    (Some(p), None) => write!(f, "DECIMAL({})", p),
                    _ => write!(f, "DECIMAL"),
                }
            }
            Self::String => write!(f, "STRING"),
            Self::Bytes => write!(f, "BYTES"),
            Self::Date => write!(f, "DATE"),
            Self::Timestamp => write!(f, "TIMESTAMP"),
            Self::Json => write!(f, "JSON"),
            Self::Struct => write!(f, "STRUCT"),
            Self::Array { element_type } => write!(f, "ARRAY<{}>", element_type),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Nullability state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nullability {
    /// Definitely nullable
    Yes,

    /// Definitely not nullable
    No,

    /// Cannot determine nullability
    Unknown,
}

/// A column in a table. Record columns nest their members in `fields`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    /// Column name
    pub name: String,

    /// Type name exactly as the backend reports it
    pub data_type: String,

    /// Logical type
    pub logical_type: LogicalType,

    /// Nullability
    pub nullable: Nullability,

    /// Whether the column holds a list of values (BigQuery `REPEATED`)
    #[serde(default)]
    pub repeated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Nested members of a record column
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
}

impl Field {
    /// Create a new field with unknown nullability
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            logical_type,
            nullable: Nullability::Unknown,
            repeated: false,
            description: None,
            fields: Vec::new(),
        }
    }

    /// Set nullability
    pub fn with_nullability(mut self, nullable: Nullability) -> Self {
        self.nullable = nullable;
        self
    }

    /// Mark as repeated
    pub fn with_repeated(mut self, repeated: bool) -> Self {
        self.repeated = repeated;
        self
    }

    /// Set description
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Set nested members
    pub fn with_fields(mut self, fields: Vec<Field>) -> Self {
        self.fields = fields;
        self
    }

    /// Depth of the deepest nested member, counting this field as 1
    pub fn depth(&self) -> usize {
        1 + self.fields.iter().map(Field::depth).max().unwrap_or(0)
    }
}

/// A table with its full column schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether the table may be exposed to AI assistants. Stored here,
    /// acted on by callers.
    #[serde(rename = "includedInAIContext", default = "default_included")]
    pub included_in_ai_context: bool,

    /// Ordered columns
    pub fields: Vec<Field>,
}

fn default_included() -> bool {
    true
}

impl Table {
    /// Create a table with no description, included in AI context
    pub fn new(id: impl Into<String>, name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            included_in_ai_context: true,
            fields,
        }
    }

    /// Set description
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Find a top-level column by name
    pub fn find_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A dataset (BigQuery dataset, Postgres schema)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Number of tables in the dataset, known before `tables` is populated
    pub table_count: u64,

    /// Tables loaded so far; empty until requested
    #[serde(default)]
    pub tables: Vec<Arc<Table>>,
}

impl Dataset {
    /// Create a dataset whose tables have not been fetched yet
    pub fn new(id: impl Into<String>, name: impl Into<String>, table_count: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            table_count,
            tables: Vec::new(),
        }
    }

    /// Set description
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Find a loaded table by id
    pub fn find_table(&self, table_id: &str) -> Option<&Arc<Table>> {
        self.tables.iter().find(|t| t.id == table_id)
    }
}

/// Top-level grouping (warehouse project, relational database)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub datasets: Vec<Arc<Dataset>>,
}

impl Project {
    /// Create a project from its datasets
    pub fn new(id: impl Into<String>, name: impl Into<String>, datasets: Vec<Dataset>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            datasets: datasets.into_iter().map(Arc::new).collect(),
        }
    }

    /// Find a dataset by id
    pub fn find_dataset(&self, dataset_id: &str) -> Option<&Arc<Dataset>> {
        self.datasets.iter().find(|d| d.id == dataset_id)
    }
}

/// The whole catalog of one connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataTree {
    pub projects: Vec<Arc<Project>>,
}

impl MetadataTree {
    /// Build a tree from freshly fetched projects
    pub fn from_projects(projects: Vec<Project>) -> Self {
        Self {
            projects: projects.into_iter().map(Arc::new).collect(),
        }
    }

    /// Find a dataset by id across all projects
    pub fn find_dataset(&self, dataset_id: &str) -> Option<&Arc<Dataset>> {
        self.projects.iter().find_map(|p| p.find_dataset(dataset_id))
    }

    /// Total number of datasets
    pub fn dataset_count(&self) -> usize {
        self.projects.iter().map(|p| p.datasets.len()).sum()
    }
}

/// One page of `fetch_tables_for_dataset`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TablePage {
    pub tables: Vec<Table>,

    /// Present when more tables remain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

impl TablePage {
    /// A page with no continuation
    pub fn last(tables: Vec<Table>) -> Self {
        Self {
            tables,
            next_page_token: None,
        }
    }

    /// Whether the listing fully drained with this page
    pub fn is_last(&self) -> bool {
        self.next_page_token.is_none()
    }
}
