//! Node pool abstraction and the Postgres implementation.
//!
//! [`DbNode`] is the seam between routing/failover logic and an actual
//! database: a node runs one query per call, answers a trivial probe,
//! and can be closed. Result rows come back as JSON maps so callers
//! decode into domain types without depending on the driver.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row, TypeInfo};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::settings::PoolSettings;

/// A bindable query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Uuid(Uuid),
    Text(String),
    Json(Value),
    Int(i64),
    Timestamp(DateTime<Utc>),
    Bool(bool),
    Null,
}

/// Result of one query: decoded rows plus the affected-row count.
///
/// Mutating statements in this system always carry `RETURNING`, so the
/// row count doubles as the affected count.
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub rows: Vec<Map<String, Value>>,
    pub rows_affected: u64,
}

/// A single database node (primary or replica) behind a pool.
#[async_trait]
pub trait DbNode: Send + Sync {
    /// Stable label for logging and events ("primary", "replica-0", ...).
    fn label(&self) -> &str;

    /// Acquire a connection, run the query, release the connection.
    async fn query(&self, sql: &str, params: &[SqlParam]) -> DbResult<QueryOutput>;

    /// Trivial read (`SELECT 1`) to check the node is answering.
    async fn probe(&self) -> bool;

    /// Close the underlying pool.
    async fn close(&self);
}

// ── Postgres node ──────────────────────────────────────────────────

/// Production node over an sqlx Postgres pool.
pub struct PgNode {
    label: String,
    pool: PgPool,
}

impl PgNode {
    /// Create the pool and verify nothing about connectivity — sqlx
    /// connects lazily, so an unreachable node surfaces on first use.
    pub async fn connect(label: impl Into<String>, settings: &PoolSettings) -> DbResult<Self> {
        let mut opts = PgConnectOptions::from_str(&settings.url)
            .map_err(|e| DbError::Pool(e.to_string()))?;
        if settings.tls {
            opts = opts.ssl_mode(PgSslMode::Require);
        }

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .idle_timeout(settings.idle_timeout)
            .acquire_timeout(settings.connect_timeout)
            .connect_lazy_with(opts);

        let label = label.into();
        debug!(node = %label, "postgres pool created");
        Ok(Self { label, pool })
    }
}

#[async_trait]
impl DbNode for PgNode {
    fn label(&self) -> &str {
        &self.label
    }

    async fn query(&self, sql: &str, params: &[SqlParam]) -> DbResult<QueryOutput> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;

        let rows = rows
            .iter()
            .map(row_to_json)
            .collect::<DbResult<Vec<_>>>()?;

        Ok(QueryOutput {
            rows_affected: rows.len() as u64,
            rows,
        })
    }

    async fn probe(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn close(&self) {
        self.pool.close().await;
        debug!(node = %self.label, "postgres pool closed");
    }
}

fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &SqlParam,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        SqlParam::Uuid(u) => query.bind(*u),
        SqlParam::Text(s) => query.bind(s.clone()),
        SqlParam::Json(v) => query.bind(v.clone()),
        SqlParam::Int(i) => query.bind(*i),
        SqlParam::Timestamp(t) => query.bind(*t),
        SqlParam::Bool(b) => query.bind(*b),
        SqlParam::Null => query.bind(Option::<String>::None),
    }
}

/// Decode a row into a JSON map keyed by column name, mapping the
/// column types the stores schema uses.
fn row_to_json(row: &PgRow) -> DbResult<Map<String, Value>> {
    let mut map = Map::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "UUID" => row
                .try_get::<Option<Uuid>, _>(idx)
                .map(|v| v.map_or(Value::Null, |u| Value::String(u.to_string()))),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => row
                .try_get::<Option<String>, _>(idx)
                .map(|v| v.map_or(Value::Null, Value::String)),
            "JSONB" | "JSON" => row
                .try_get::<Option<Value>, _>(idx)
                .map(|v| v.unwrap_or(Value::Null)),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)
                .map(|v| v.map_or(Value::Null, |i| Value::from(i64::from(i)))),
            "INT8" => row
                .try_get::<Option<i64>, _>(idx)
                .map(|v| v.map_or(Value::Null, Value::from)),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(idx)
                .map(|v| v.map_or(Value::Null, Value::from)),
            "BOOL" => row
                .try_get::<Option<bool>, _>(idx)
                .map(|v| v.map_or(Value::Null, Value::Bool)),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)
                .map(|v| v.map_or(Value::Null, |t| Value::String(t.to_rfc3339()))),
            other => {
                debug!(column = column.name(), r#type = other, "unmapped column type");
                Ok(Value::Null)
            }
        }
        .map_err(|e| DbError::Decode(format!("column {}: {e}", column.name())))?;

        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}
