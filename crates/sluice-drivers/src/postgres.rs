//! PostgreSQL sessions over `deadpool-postgres`
//!
//! Works with PostgreSQL 9.4+ and most wire-compatible servers (Redshift,
//! CockroachDB). TLS goes through `native-tls` when the integration sets
//! `ssl = true`.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol.html

use crate::driver::Driver;
use sluice_core::{DriverError, RelationalCredentials, RelationalSettings};
use std::sync::Arc;

#[cfg(feature = "postgres")]
pub use pg::{PgCanceller, PgSession, PgSessionPool};

/// Build a connected-on-demand PostgreSQL driver for an integration
#[cfg(feature = "postgres")]
pub fn relational_driver(
    credentials: &RelationalCredentials,
    settings: &RelationalSettings,
) -> Result<Arc<dyn Driver>, DriverError> {
    let pool = PgSessionPool::new(credentials.clone(), settings.clone())?;
    Ok(Arc::new(crate::relational::RelationalDriver::new(pool)))
}

/// Create driver without postgres feature (returns error)
#[cfg(not(feature = "postgres"))]
pub fn relational_driver(
    _credentials: &RelationalCredentials,
    _settings: &RelationalSettings,
) -> Result<Arc<dyn Driver>, DriverError> {
    Err(DriverError::Unsupported(
        "PostgreSQL support not compiled. Rebuild with: cargo build --features postgres".to_string(),
    ))
}

#[cfg(feature = "postgres")]
mod pg {
    use crate::relational::{BackendCanceller, Session, SessionPool, StatementError};
    use deadpool_postgres::{
        Config as PoolSettings, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime,
        Timeouts,
    };
    use native_tls::TlsConnector;
    use rust_decimal::Decimal;
    use postgres_native_tls::MakeTlsConnector;
    use serde_json::{Map, Number, Value};
    use sluice_core::{DriverError, RelationalCredentials, RelationalSettings, Row};
    use std::error::Error as StdError;
    use std::sync::RwLock;
    use tokio_postgres::types::{FromSql, ToSql, Type};
    use tokio_postgres::{CancelToken, NoTls};

    /// Column value kept as raw wire bytes
    struct RawValue(Vec<u8>);

    impl<'a> FromSql<'a> for RawValue {
        fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
            Ok(RawValue(raw.to_vec()))
        }

        fn accepts(_: &Type) -> bool {
            true
        }
    }

    fn statement_error(e: tokio_postgres::Error) -> StatementError {
        match e.as_db_error() {
            Some(db) => StatementError::new(Some(db.code().code()), db.message()),
            None => StatementError::new(e.code().map(|c| c.code()), e.to_string()),
        }
    }

    fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T> {
        row.try_get::<_, Option<T>>(idx).ok().flatten()
    }

    fn float(value: Option<f64>) -> Value {
        value.and_then(Number::from_f64).map(Value::Number).unwrap_or(Value::Null)
    }

    /// `numeric` as exact decimal text. Values `Decimal` cannot hold (NaN,
    /// infinities, more than 28 significant digits) come back as null.
    fn numeric(value: Option<Decimal>) -> Value {
        value.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null)
    }

    /// `bytea` in the server's hex output format
    fn bytea(value: Option<Vec<u8>>) -> Value {
        value
            .map(|bytes| Value::String(format!("\\x{}", hex::encode(bytes))))
            .unwrap_or(Value::Null)
    }

    fn list<T, F>(values: Option<Vec<Option<T>>>, convert: F) -> Value
    where
        F: Fn(T) -> Value,
    {
        values
            .map(|items| {
                Value::Array(
                    items
                        .into_iter()
                        .map(|item| item.map(&convert).unwrap_or(Value::Null))
                        .collect(),
                )
            })
            .unwrap_or(Value::Null)
    }

    fn cell_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
        match *ty {
            Type::BOOL => get::<bool>(row, idx).map(Value::Bool).unwrap_or(Value::Null),
            Type::INT2 => get::<i16>(row, idx).map(Value::from).unwrap_or(Value::Null),
            Type::INT4 => get::<i32>(row, idx).map(Value::from).unwrap_or(Value::Null),
            Type::INT8 => get::<i64>(row, idx).map(Value::from).unwrap_or(Value::Null),
            Type::OID => get::<u32>(row, idx).map(Value::from).unwrap_or(Value::Null),
            Type::FLOAT4 => float(get::<f32>(row, idx).map(f64::from)),
            Type::FLOAT8 => float(get::<f64>(row, idx)),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                get::<String>(row, idx).map(Value::String).unwrap_or(Value::Null)
            }
            Type::JSON | Type::JSONB => get::<Value>(row, idx).unwrap_or(Value::Null),
            Type::UUID => get::<uuid::Uuid>(row, idx)
                .map(|u| Value::String(u.to_string()))
                .unwrap_or(Value::Null),
            Type::DATE => get::<chrono::NaiveDate>(row, idx)
                .map(|d| Value::String(d.to_string()))
                .unwrap_or(Value::Null),
            Type::TIME => get::<chrono::NaiveTime>(row, idx)
                .map(|t| Value::String(t.to_string()))
                .unwrap_or(Value::Null),
            Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)
                .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null),
            Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, idx)
                .map(|t| Value::String(t.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)))
                .unwrap_or(Value::Null),
            Type::BYTEA => bytea(get::<Vec<u8>>(row, idx)),
            Type::NUMERIC => numeric(get::<Decimal>(row, idx)),
            Type::BOOL_ARRAY => list(get::<Vec<Option<bool>>>(row, idx), Value::Bool),
            Type::INT4_ARRAY => list(get::<Vec<Option<i32>>>(row, idx), Value::from),
            Type::INT8_ARRAY => list(get::<Vec<Option<i64>>>(row, idx), Value::from),
            Type::FLOAT8_ARRAY => list(get::<Vec<Option<f64>>>(row, idx), |f| float(Some(f))),
            Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
                list(get::<Vec<Option<String>>>(row, idx), Value::String)
            }
            _ => get::<RawValue>(row, idx)
                .and_then(|raw| String::from_utf8(raw.0).ok())
                .map(Value::String)
                .unwrap_or(Value::Null),
        }
    }

    fn row_to_json(row: &tokio_postgres::Row) -> Row {
        let mut map = Map::with_capacity(row.len());
        for (idx, column) in row.columns().iter().enumerate() {
            map.insert(column.name().to_string(), cell_value(row, idx, column.type_()));
        }
        map
    }

    /// Out-of-band cancel for one backend, sent over a fresh socket
    #[derive(Clone)]
    pub struct PgCanceller {
        token: CancelToken,
        tls: Option<MakeTlsConnector>,
    }

    #[async_trait::async_trait]
    impl BackendCanceller for PgCanceller {
        async fn cancel(&self) -> Result<(), DriverError> {
            let sent = match &self.tls {
                Some(tls) => self.token.cancel_query(tls.clone()).await,
                None => self.token.cancel_query(NoTls).await,
            };
            sent.map_err(|e| DriverError::Connection(format!("cancel request failed: {}", e)))
        }
    }

    /// Pooled connection held by a query or catalog call
    pub struct PgSession {
        client: Object,
        tls: Option<MakeTlsConnector>,
    }

    #[async_trait::async_trait]
    impl Session for PgSession {
        type Canceller = PgCanceller;

        async fn backend_pid(&mut self) -> Result<i32, StatementError> {
            let row = self
                .client
                .query_one("SELECT pg_backend_pid()", &[])
                .await
                .map_err(statement_error)?;
            row.try_get(0).map_err(statement_error)
        }

        fn canceller(&self) -> PgCanceller {
            PgCanceller {
                token: self.client.cancel_token(),
                tls: self.tls.clone(),
            }
        }

        async fn query(&mut self, sql: &str, params: &[&str]) -> Result<Vec<Row>, StatementError> {
            let params: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            let rows = self
                .client
                .query(sql, &params)
                .await
                .map_err(statement_error)?;
            Ok(rows.iter().map(row_to_json).collect())
        }
    }

    /// `deadpool-postgres` pool built from integration credentials
    pub struct PgSessionPool {
        credentials: RelationalCredentials,
        settings: RelationalSettings,
        tls: Option<MakeTlsConnector>,
        pool: RwLock<Option<Pool>>,
    }

    impl PgSessionPool {
        pub fn new(
            credentials: RelationalCredentials,
            settings: RelationalSettings,
        ) -> Result<Self, DriverError> {
            let tls = if credentials.ssl {
                let connector = TlsConnector::builder().build().map_err(|e| {
                    DriverError::Config(format!("Failed to create TLS connector: {}", e))
                })?;
                Some(MakeTlsConnector::new(connector))
            } else {
                None
            };

            Ok(Self {
                credentials,
                settings,
                tls,
                pool: RwLock::new(None),
            })
        }

        fn current(&self) -> Option<Pool> {
            self.pool
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }

        fn pool_settings(&self) -> PoolSettings {
            let mut cfg = PoolSettings::new();
            cfg.host = Some(self.credentials.host.clone());
            cfg.port = Some(self.credentials.port);
            cfg.dbname = Some(self.credentials.database.clone());
            cfg.user = Some(self.credentials.user.clone());
            cfg.password = Some(self.credentials.password.clone());
            cfg.manager = Some(ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            });

            let mut pool = PoolConfig::new(self.settings.pool_max_size);
            pool.timeouts = Timeouts {
                wait: self.settings.acquire_timeout(),
                create: self.settings.acquire_timeout(),
                recycle: None,
            };
            cfg.pool = Some(pool);
            cfg
        }
    }

    #[async_trait::async_trait]
    impl SessionPool for PgSessionPool {
        type Session = PgSession;

        async fn open(&self) -> Result<(), DriverError> {
            let cfg = self.pool_settings();
            let created = match &self.tls {
                Some(tls) => cfg.create_pool(Some(Runtime::Tokio1), tls.clone()),
                None => cfg.create_pool(Some(Runtime::Tokio1), NoTls),
            };
            let pool = created
                .map_err(|e| DriverError::Config(format!("Invalid pool configuration: {}", e)))?;

            let previous = self
                .pool
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .replace(pool);
            if let Some(previous) = previous {
                previous.close();
            }
            Ok(())
        }

        async fn acquire(&self) -> Result<PgSession, DriverError> {
            let pool = self
                .current()
                .ok_or_else(|| DriverError::Connection("connection pool is closed".to_string()))?;

            let client = pool.get().await.map_err(|e| {
                DriverError::Connection(format!(
                    "Failed to connect to PostgreSQL at {}:{}: {}",
                    self.credentials.host, self.credentials.port, e
                ))
            })?;

            Ok(PgSession {
                client,
                tls: self.tls.clone(),
            })
        }

        async fn close(&self) {
            let pool = self
                .pool
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            if let Some(pool) = pool {
                pool.close();
            }
        }

        fn checked_out(&self) -> usize {
            self.current()
                .map(|pool| {
                    let status = pool.status();
                    status.size.saturating_sub(status.available)
                })
                .unwrap_or(0)
        }
    }

}

#[cfg(all(test, not(feature = "postgres")))]
mod tests {
    use super::*;

    #[test]
    fn driver_requires_feature() {
        let credentials = RelationalCredentials {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            ssl: false,
        };
        assert!(matches!(
            relational_driver(&credentials, &RelationalSettings::default()),
            Err(DriverError::Unsupported(_))
        ));
    }
}
