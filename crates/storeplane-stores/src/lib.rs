//! Store lifecycle management: persistence, provisioning workflow,
//! auditing, and secrets.

pub mod audit;
pub mod error;
pub mod repository;
pub mod secrets;
pub mod service;

pub use audit::{AuditAction, AuditRecord, AuditSink, DbAuditSink};
pub use error::{StoreError, StoreResult};
pub use repository::{ensure_schema, SqlStoreRepository, StoreChanges, StoreRepository};
pub use secrets::{
    default_provider, EnvFallback, NoBackingStore, SecretProvider, DATABASE_PRIMARY_PATH,
};
pub use service::{
    AllowAll, CreateGate, CreateStoreRequest, Provisioner, StoreService, UpdateStoreRequest,
};
