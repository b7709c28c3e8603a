//! MySQL Driver
//!
//! Implements the QueryEngine trait for MySQL/MariaDB using a shared SQLx
//! pool. Parameters always go through the prepared-statement protocol.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{
    MySql, MySqlArguments, MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow,
};
use sqlx::query::Query;
use sqlx::{Column, Row as SqlxRow};
use tracing::{debug, info};

use crate::config::Settings;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::QueryEngine;
use crate::engine::types::{ExecutionOutcome, OutcomeShape, QueryParam, Row, Value};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pooled MySQL execution backend
pub struct MySqlEngine {
    pool: MySqlPool,
}

impl MySqlEngine {
    /// Opens a pool sized by `pool_size`.
    pub async fn connect(settings: &Settings) -> EngineResult<Self> {
        let options = MySqlConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(settings.password.expose())
            .database(&settings.database);

        let pool = MySqlPoolOptions::new()
            .max_connections(settings.pool_size)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("Access denied") {
                    EngineError::auth_failed(msg)
                } else {
                    EngineError::connection_failed(msg)
                }
            })?;

        info!(
            database = %settings.connection_string_safe(),
            pool_size = settings.pool_size,
            "MySQL pool ready"
        );
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn bind_params<'q>(
        mut query: Query<'q, MySql, MySqlArguments>,
        params: &[QueryParam],
    ) -> Query<'q, MySql, MySqlArguments> {
        for param in params {
            query = match param {
                QueryParam::Null => query.bind(None::<String>),
                QueryParam::Bool(b) => query.bind(*b),
                QueryParam::Int(i) => query.bind(*i),
                QueryParam::Float(f) => query.bind(*f),
                QueryParam::Text(s) => query.bind(s.clone()),
            };
        }
        query
    }

    /// Converts a SQLx row, keeping select-list column order
    fn convert_row(mysql_row: &MySqlRow) -> Row {
        let mut row = Row::new();
        for col in mysql_row.columns() {
            row.push(col.name(), Self::extract_value(mysql_row, col.ordinal()));
        }
        row
    }

    /// Extracts a value from a MySqlRow at the given index
    fn extract_value(row: &MySqlRow, idx: usize) -> Value {
        // Try u64 first for BIGINT UNSIGNED columns
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(unsigned_value).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u16>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u8>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v
                .map(|t| Value::Text(t.format("%H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }

        Value::Null
    }
}

/// BIGINT UNSIGNED values past i64::MAX are kept exact as text.
fn unsigned_value(value: u64) -> Value {
    i64::try_from(value)
        .map(Value::Int)
        .unwrap_or_else(|_| Value::Text(value.to_string()))
}

fn map_query_error(error: sqlx::Error) -> EngineError {
    match error {
        sqlx::Error::Database(db) => {
            let msg = db.message().to_string();
            if msg.contains("syntax") {
                EngineError::syntax_error(msg)
            } else {
                EngineError::execution_error(msg)
            }
        }
        sqlx::Error::PoolTimedOut => {
            EngineError::connection_failed("timed out waiting for a pooled connection")
        }
        e @ (sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_)) => {
            EngineError::connection_failed(e.to_string())
        }
        e => EngineError::execution_error(e.to_string()),
    }
}

#[async_trait]
impl QueryEngine for MySqlEngine {
    fn driver_id(&self) -> &'static str {
        "mysql"
    }

    async fn execute(
        &self,
        query: &str,
        params: &[QueryParam],
        shape: OutcomeShape,
    ) -> EngineResult<ExecutionOutcome> {
        let statement = Self::bind_params(sqlx::query(query), params);

        match shape {
            OutcomeShape::Rows => {
                let mysql_rows: Vec<MySqlRow> = statement
                    .fetch_all(&self.pool)
                    .await
                    .map_err(map_query_error)?;
                debug!(rows = mysql_rows.len(), "Fetched result set");
                Ok(ExecutionOutcome::Rows(
                    mysql_rows.iter().map(Self::convert_row).collect(),
                ))
            }
            OutcomeShape::AffectedCount => {
                let result = statement
                    .execute(&self.pool)
                    .await
                    .map_err(map_query_error)?;
                Ok(ExecutionOutcome::AffectedCount(result.rows_affected()))
            }
        }
    }
}
