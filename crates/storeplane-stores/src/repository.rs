//! Store persistence over the failover-aware connection manager.
//!
//! Every mutation carries `RETURNING`, so an empty result means the
//! guard in the WHERE clause did not match: the optimistic-concurrency
//! conflict signal.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use storeplane_core::{Store, StoreConfig, StoreId, StoreStatus};
use storeplane_db::{ConnectionManager, DbError, QueryOptions, SqlParam};
use tracing::info;

use crate::error::{StoreError, StoreResult};

const SCHEMA: &str = include_str!("schema.sql");

/// Create tables and indexes if they are missing. Statements run one
/// at a time; prepared execution does not accept multi-statement text.
pub async fn ensure_schema(db: &ConnectionManager) -> StoreResult<()> {
    for statement in SCHEMA.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        db.execute(statement, &[], QueryOptions::default()).await?;
    }
    info!("store schema ensured");
    Ok(())
}

/// Field-level changes for a conditional update. Absent fields keep
/// their stored value.
#[derive(Debug, Clone, Default)]
pub struct StoreChanges {
    pub name: Option<String>,
    pub status: Option<StoreStatus>,
    pub config: Option<StoreConfig>,
}

impl StoreChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.status.is_none() && self.config.is_none()
    }
}

/// Persistence seam for store rows. The SQL implementation talks to
/// Postgres through the connection manager; tests provide an in-memory
/// one with the same compare-and-swap semantics.
#[async_trait]
pub trait StoreRepository: Send + Sync {
    async fn insert(&self, store: &Store) -> StoreResult<()>;

    /// Fetch by id, decommissioned rows included.
    async fn get(&self, id: &StoreId) -> StoreResult<Option<Store>>;

    /// Live (not decommissioned) stores, newest first.
    async fn list(&self) -> StoreResult<Vec<Store>>;

    /// Conditional update: applies only when the stored version equals
    /// `expected_version`. `None` means nothing matched.
    async fn update(
        &self,
        id: &StoreId,
        expected_version: i64,
        changes: &StoreChanges,
    ) -> StoreResult<Option<Store>>;

    /// Provisioning terminal transition: only fires while the row is
    /// still in `provisioning`.
    async fn mark_ready(&self, id: &StoreId, url: &str, namespace: &str) -> StoreResult<bool>;

    async fn mark_failed(&self, id: &StoreId) -> StoreResult<bool>;

    /// Soft delete: stamps `decommissioned_at` on a live `ready` row.
    async fn decommission(&self, id: &StoreId) -> StoreResult<Option<Store>>;
}

// ── SQL implementation ─────────────────────────────────────────────

pub struct SqlStoreRepository {
    db: Arc<ConnectionManager>,
}

impl SqlStoreRepository {
    pub fn new(db: Arc<ConnectionManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StoreRepository for SqlStoreRepository {
    async fn insert(&self, store: &Store) -> StoreResult<()> {
        let sql = "INSERT INTO stores \
                   (id, name, status, config, version, engine, url, namespace, \
                    created_at, updated_at, decommissioned_at) \
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                   RETURNING id";
        let config = serde_json::to_value(&store.config)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let params = [
            SqlParam::Uuid(store.id.as_uuid()),
            SqlParam::Text(store.name.clone()),
            SqlParam::Text(store.status.as_str().to_string()),
            SqlParam::Json(config),
            SqlParam::Int(store.version),
            SqlParam::Text(store.engine.as_str().to_string()),
            opt_text(&store.url),
            opt_text(&store.namespace),
            SqlParam::Timestamp(store.created_at),
            SqlParam::Timestamp(store.updated_at),
            store
                .decommissioned_at
                .map(SqlParam::Timestamp)
                .unwrap_or(SqlParam::Null),
        ];
        match self.db.execute(sql, &params, QueryOptions::default()).await {
            Ok(_) => Ok(()),
            Err(e) => Err(insert_error(&store.id.to_string(), e)),
        }
    }

    async fn get(&self, id: &StoreId) -> StoreResult<Option<Store>> {
        let output = self
            .db
            .execute(
                "SELECT * FROM stores WHERE id = $1",
                &[SqlParam::Uuid(id.as_uuid())],
                QueryOptions::default(),
            )
            .await?;
        output.rows.first().map(store_from_row).transpose()
    }

    async fn list(&self) -> StoreResult<Vec<Store>> {
        let output = self
            .db
            .execute(
                "SELECT * FROM stores WHERE decommissioned_at IS NULL ORDER BY created_at DESC",
                &[],
                QueryOptions::replica(),
            )
            .await?;
        output.rows.iter().map(store_from_row).collect()
    }

    async fn update(
        &self,
        id: &StoreId,
        expected_version: i64,
        changes: &StoreChanges,
    ) -> StoreResult<Option<Store>> {
        let (sql, params) = build_update_sql(id, expected_version, Utc::now(), changes)?;
        let output = self
            .db
            .execute(&sql, &params, QueryOptions::default())
            .await?;
        output.rows.first().map(store_from_row).transpose()
    }

    async fn mark_ready(&self, id: &StoreId, url: &str, namespace: &str) -> StoreResult<bool> {
        let sql = "UPDATE stores \
                   SET status = 'ready', url = $1, namespace = $2, \
                       version = version + 1, updated_at = $3 \
                   WHERE id = $4 AND status = 'provisioning' \
                   RETURNING id";
        let params = [
            SqlParam::Text(url.to_string()),
            SqlParam::Text(namespace.to_string()),
            SqlParam::Timestamp(Utc::now()),
            SqlParam::Uuid(id.as_uuid()),
        ];
        let output = self
            .db
            .execute(sql, &params, QueryOptions::default())
            .await?;
        Ok(!output.rows.is_empty())
    }

    async fn mark_failed(&self, id: &StoreId) -> StoreResult<bool> {
        let sql = "UPDATE stores \
                   SET status = 'failed', version = version + 1, updated_at = $1 \
                   WHERE id = $2 AND status = 'provisioning' \
                   RETURNING id";
        let params = [
            SqlParam::Timestamp(Utc::now()),
            SqlParam::Uuid(id.as_uuid()),
        ];
        let output = self
            .db
            .execute(sql, &params, QueryOptions::default())
            .await?;
        Ok(!output.rows.is_empty())
    }

    async fn decommission(&self, id: &StoreId) -> StoreResult<Option<Store>> {
        let sql = "UPDATE stores \
                   SET status = 'decommissioned', decommissioned_at = $1, \
                       version = version + 1, updated_at = $1 \
                   WHERE id = $2 AND status = 'ready' AND decommissioned_at IS NULL \
                   RETURNING *";
        let params = [
            SqlParam::Timestamp(Utc::now()),
            SqlParam::Uuid(id.as_uuid()),
        ];
        let output = self
            .db
            .execute(sql, &params, QueryOptions::default())
            .await?;
        output.rows.first().map(store_from_row).transpose()
    }
}

// ── SQL assembly and row decoding ──────────────────────────────────

fn opt_text(value: &Option<String>) -> SqlParam {
    match value {
        Some(s) => SqlParam::Text(s.clone()),
        None => SqlParam::Null,
    }
}

/// Postgres reports a primary-key collision as a unique violation; the
/// message is the only signal the node layer passes through.
fn insert_error(id: &str, e: DbError) -> StoreError {
    match &e {
        DbError::Query(msg) if msg.contains("duplicate key") => {
            StoreError::AlreadyExists(id.to_string())
        }
        _ => e.into(),
    }
}

/// Assemble the minimal conditional UPDATE for the requested changes.
pub fn build_update_sql(
    id: &StoreId,
    expected_version: i64,
    now: DateTime<Utc>,
    changes: &StoreChanges,
) -> StoreResult<(String, Vec<SqlParam>)> {
    let mut sets = vec!["updated_at = $1".to_string(), "version = version + 1".to_string()];
    let mut params = vec![SqlParam::Timestamp(now)];

    if let Some(name) = &changes.name {
        params.push(SqlParam::Text(name.clone()));
        sets.push(format!("name = ${}", params.len()));
    }
    if let Some(status) = changes.status {
        params.push(SqlParam::Text(status.as_str().to_string()));
        sets.push(format!("status = ${}", params.len()));
    }
    if let Some(config) = &changes.config {
        let value =
            serde_json::to_value(config).map_err(|e| StoreError::Internal(e.to_string()))?;
        params.push(SqlParam::Json(value));
        sets.push(format!("config = ${}", params.len()));
    }

    params.push(SqlParam::Uuid(id.as_uuid()));
    let id_slot = params.len();
    params.push(SqlParam::Int(expected_version));
    let version_slot = params.len();

    let sql = format!(
        "UPDATE stores SET {} WHERE id = ${id_slot} AND version = ${version_slot} RETURNING *",
        sets.join(", "),
    );
    Ok((sql, params))
}

fn field<'a>(row: &'a Map<String, Value>, name: &str) -> StoreResult<&'a Value> {
    row.get(name)
        .ok_or_else(|| StoreError::Internal(format!("store row missing column '{name}'")))
}

fn text(row: &Map<String, Value>, name: &str) -> StoreResult<String> {
    match field(row, name)? {
        Value::String(s) => Ok(s.clone()),
        other => Err(StoreError::Internal(format!(
            "store column '{name}' not text: {other}"
        ))),
    }
}

fn opt_string(row: &Map<String, Value>, name: &str) -> StoreResult<Option<String>> {
    match field(row, name)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        other => Err(StoreError::Internal(format!(
            "store column '{name}' not text: {other}"
        ))),
    }
}

fn timestamp(row: &Map<String, Value>, name: &str) -> StoreResult<DateTime<Utc>> {
    let raw = text(row, name)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Internal(format!("store column '{name}' not a timestamp: {e}")))
}

/// Decode one JSON row from the node layer into a `Store`.
pub fn store_from_row(row: &Map<String, Value>) -> StoreResult<Store> {
    let id = StoreId::parse(&text(row, "id")?)
        .map_err(|e| StoreError::Internal(e.to_string()))?;
    let status: StoreStatus = text(row, "status")?
        .parse()
        .map_err(StoreError::Internal)?;
    let engine = text(row, "engine")?
        .parse()
        .map_err(|e: storeplane_core::UnsupportedEngine| StoreError::Internal(e.to_string()))?;
    let config: StoreConfig = serde_json::from_value(field(row, "config")?.clone())
        .map_err(|e| StoreError::Internal(format!("store config undecodable: {e}")))?;
    let version = field(row, "version")?
        .as_i64()
        .ok_or_else(|| StoreError::Internal("store version not an integer".to_string()))?;

    let decommissioned_at = match field(row, "decommissioned_at")? {
        Value::Null => None,
        _ => Some(timestamp(row, "decommissioned_at")?),
    };

    Ok(Store {
        id,
        name: text(row, "name")?,
        status,
        config,
        version,
        engine,
        url: opt_string(row, "url")?,
        namespace: opt_string(row, "namespace")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
        decommissioned_at,
    })
}
