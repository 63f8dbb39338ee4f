//! storeplane-db — primary/replica data-access layer.
//!
//! The [`ConnectionManager`] owns one primary pool and zero-or-more
//! replica pools, executes queries with bounded retry and linear
//! backoff, and fails over to a healthy replica when the primary stops
//! answering. Pool health is probed by independent background tasks;
//! failover and health changes are published on a typed bounded event
//! channel rather than dynamic listeners.
//!
//! Queries go through the [`DbNode`] trait so the failover logic is
//! exercised in tests with scripted in-memory nodes; `PgNode` is the
//! production implementation over an sqlx Postgres pool.

pub mod error;
pub mod manager;
pub mod node;
pub mod settings;

pub use error::{DbError, DbResult};
pub use manager::{ConnectionManager, DbEvent, FailoverCause, ManagerOptions, QueryOptions};
pub use node::{DbNode, PgNode, QueryOutput, SqlParam};
pub use settings::{DatabaseSettings, PoolSettings};
