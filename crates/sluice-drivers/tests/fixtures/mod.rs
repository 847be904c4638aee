//! Catalog fixtures for driver integration tests
//!
//! Small, realistic catalogs: an analytics project with a sales dataset and
//! an empty staging dataset.

#![allow(dead_code)]

use serde_json::{json, Value};
use sluice_core::{
    BackendCredentials, Dataset, Field, Integration, LogicalType, Nullability, Project, Row,
    Table, WarehouseCredentials,
};

/// A typical users table
pub fn users_table() -> Table {
    Table::new(
        "users",
        "Users",
        vec![
            Field::new("id", "INT64", LogicalType::Int).with_nullability(Nullability::No),
            Field::new("email", "STRING", LogicalType::String).with_nullability(Nullability::No),
            Field::new("created_at", "TIMESTAMP", LogicalType::Timestamp),
        ],
    )
}

/// An orders table with a nested line-item record
pub fn orders_table() -> Table {
    Table::new(
        "orders",
        "Orders",
        vec![
            Field::new("id", "INT64", LogicalType::Int).with_nullability(Nullability::No),
            Field::new(
                "total",
                "NUMERIC(10,2)",
                LogicalType::Decimal {
                    precision: Some(10),
                    scale: Some(2),
                },
            ),
            Field::new("items", "RECORD", LogicalType::Struct)
                .with_repeated(true)
                .with_fields(vec![
                    Field::new("sku", "STRING", LogicalType::String),
                    Field::new("qty", "INT64", LogicalType::Int),
                ]),
        ],
    )
    .with_description(Some("One row per order".to_string()))
}

pub fn events_table() -> Table {
    Table::new(
        "events",
        "events",
        vec![Field::new("payload", "JSON", LogicalType::Json)],
    )
}

/// analytics: sales (3 tables), staging (0 tables)
pub fn analytics_project() -> Project {
    Project::new(
        "analytics",
        "analytics",
        vec![
            Dataset::new("sales", "Sales", 3),
            Dataset::new("staging", "staging", 0),
        ],
    )
}

pub fn warehouse_integration() -> Integration {
    Integration::new(
        "integration-analytics",
        "Analytics warehouse",
        BackendCredentials::Warehouse(WarehouseCredentials {
            project_id: Some("analytics".to_string()),
            service_account: json!({ "type": "service_account", "project_id": "analytics" }),
        }),
    )
}

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}
