//! Audit trail for lifecycle actions.
//!
//! Recording is fire-and-forget: a broken audit path must never fail
//! the operation being audited, so sink errors are logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use storeplane_db::{ConnectionManager, QueryOptions, SqlParam};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Create,
    FailedCreate,
    Update,
    Delete,
    FailedDelete,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::FailedCreate => "FAILED_CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::FailedDelete => "FAILED_DELETE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub resource_name: Option<String>,
    pub detail: Map<String, Value>,
}

impl AuditRecord {
    pub fn store(actor: &str, action: AuditAction, id: &str, name: Option<&str>) -> Self {
        Self {
            actor: actor.to_string(),
            action,
            resource_type: "store".to_string(),
            resource_id: id.to_string(),
            resource_name: name.map(str::to_string),
            detail: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.detail.insert(key.to_string(), value);
        self
    }
}

/// Infallible audit sink.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord);
}

/// Writes audit rows through the connection manager.
pub struct DbAuditSink {
    db: Arc<ConnectionManager>,
}

impl DbAuditSink {
    pub fn new(db: Arc<ConnectionManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditSink for DbAuditSink {
    async fn record(&self, record: AuditRecord) {
        let sql = "INSERT INTO audit_log \
                   (id, actor, action, resource_type, resource_id, resource_name, \
                    detail, recorded_at) \
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                   RETURNING id";
        let params = [
            SqlParam::Uuid(Uuid::new_v4()),
            SqlParam::Text(record.actor),
            SqlParam::Text(record.action.as_str().to_string()),
            SqlParam::Text(record.resource_type),
            SqlParam::Text(record.resource_id.clone()),
            record
                .resource_name
                .map(SqlParam::Text)
                .unwrap_or(SqlParam::Null),
            SqlParam::Json(Value::Object(record.detail)),
            SqlParam::Timestamp(Utc::now()),
        ];
        if let Err(e) = self.db.execute(sql, &params, QueryOptions::default()).await {
            warn!(
                resource_id = %record.resource_id,
                action = record.action.as_str(),
                error = %e,
                "audit record dropped"
            );
        }
    }
}
