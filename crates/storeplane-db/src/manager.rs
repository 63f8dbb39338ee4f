//! ConnectionManager — query routing, retry, failover, health checks.
//!
//! Routing state (current primary, current replica) lives behind an
//! `RwLock` so a query is never handed a pool mid-promotion or
//! mid-teardown. Health checks run as independent interval tasks;
//! failover runs at most once per exhausted query. Observers consume
//! `DbEvent`s from the bounded channel returned at construction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::node::{DbNode, PgNode, QueryOutput, SqlParam};
use crate::settings::DatabaseSettings;

/// Why a failover event fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverCause {
    /// The primary answered its probe; routing was restored to it.
    Recovered,
    /// The primary is down and a replica was promoted.
    PrimaryFailure,
    /// No node answered; routing left unchanged.
    AllUnhealthy,
}

/// Events published by the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DbEvent {
    Failover { cause: FailoverCause, target: String },
    HealthChange { component: String, healthy: bool },
}

/// Options for a single `execute` call.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    /// Route to the current replica when it is healthy.
    pub use_replica: bool,
    pub retry_attempts: u32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            use_replica: false,
            retry_attempts: 3,
        }
    }
}

impl QueryOptions {
    pub fn replica() -> Self {
        Self {
            use_replica: true,
            ..Self::default()
        }
    }
}

/// Tunables for retry, probing, and health intervals.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Base for linear retry backoff (`base × attempt`).
    pub backoff_base: Duration,
    /// Timeout applied around every probe.
    pub probe_timeout: Duration,
    pub primary_health_interval: Duration,
    pub replica_health_interval: Duration,
    pub event_capacity: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            primary_health_interval: Duration::from_secs(30),
            replica_health_interval: Duration::from_secs(45),
            event_capacity: 64,
        }
    }
}

/// A replica pool plus its health flag, mutated only by the periodic
/// health-check task.
struct ReplicaSlot {
    index: usize,
    node: Arc<dyn DbNode>,
    healthy: AtomicBool,
}

/// The shared routing selection. Written by failover and health paths,
/// read on every query.
struct Selection {
    primary: Arc<dyn DbNode>,
    replica: Option<Arc<dyn DbNode>>,
}

/// Primary/replica connection manager with retry and failover.
pub struct ConnectionManager {
    primary: Arc<dyn DbNode>,
    replicas: Vec<ReplicaSlot>,
    selection: RwLock<Selection>,
    options: ManagerOptions,
    events: mpsc::Sender<DbEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Build a manager from already-constructed nodes.
    ///
    /// The first replica (when present) starts as the current read
    /// target; replicas are assumed healthy until a probe says
    /// otherwise.
    pub fn from_nodes(
        primary: Arc<dyn DbNode>,
        replicas: Vec<Arc<dyn DbNode>>,
        options: ManagerOptions,
    ) -> (Arc<Self>, mpsc::Receiver<DbEvent>) {
        let (events_tx, events_rx) = mpsc::channel(options.event_capacity);
        let (shutdown_tx, _) = watch::channel(false);

        let slots: Vec<ReplicaSlot> = replicas
            .into_iter()
            .enumerate()
            .map(|(index, node)| ReplicaSlot {
                index,
                node,
                healthy: AtomicBool::new(true),
            })
            .collect();

        let selection = Selection {
            primary: primary.clone(),
            replica: slots.first().map(|s| s.node.clone()),
        };

        let manager = Arc::new(Self {
            primary,
            replicas: slots,
            selection: RwLock::new(selection),
            options,
            events: events_tx,
            shutdown: shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        (manager, events_rx)
    }

    /// Connect Postgres pools for the configured primary and replicas.
    pub async fn connect(
        settings: &DatabaseSettings,
        options: ManagerOptions,
    ) -> DbResult<(Arc<Self>, mpsc::Receiver<DbEvent>)> {
        let primary: Arc<dyn DbNode> =
            Arc::new(PgNode::connect("primary", &settings.primary).await?);

        let mut replicas: Vec<Arc<dyn DbNode>> = Vec::with_capacity(settings.replicas.len());
        for (index, replica) in settings.replicas.iter().enumerate() {
            replicas.push(Arc::new(
                PgNode::connect(format!("replica-{index}"), replica).await?,
            ));
        }

        info!(replicas = replicas.len(), "connection manager initialized");
        Ok(Self::from_nodes(primary, replicas, options))
    }

    // ── Query execution ────────────────────────────────────────────

    /// Execute a query with bounded retry; exhausted retries trigger
    /// failover handling once, then fail with `ConnectionFailed`.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[SqlParam],
        options: QueryOptions,
    ) -> DbResult<QueryOutput> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }

        let attempts = options.retry_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let node = self.route(options.use_replica).await;
            match node.query(sql, params).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    warn!(
                        node = node.label(),
                        attempt,
                        attempts,
                        error = %e,
                        "query attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        // Linear backoff: base × attempt number.
                        tokio::time::sleep(self.options.backoff_base * attempt).await;
                    }
                }
            }
        }

        self.handle_failover().await;
        Err(DbError::ConnectionFailed(last_error))
    }

    /// Pick the pool for this query under the selection lock.
    async fn route(&self, use_replica: bool) -> Arc<dyn DbNode> {
        let selection = self.selection.read().await;
        if use_replica {
            if let Some(replica) = &selection.replica {
                return replica.clone();
            }
        }
        selection.primary.clone()
    }

    // ── Failover ───────────────────────────────────────────────────

    /// Probe the primary; restore it if healthy, otherwise promote the
    /// first replica whose probe succeeds. With no healthy node the
    /// routing is left unchanged and later queries keep failing until
    /// something heals.
    async fn handle_failover(&self) {
        if self.probe(&self.primary).await {
            let mut selection = self.selection.write().await;
            selection.primary = self.primary.clone();
            drop(selection);
            info!("failover check: primary recovered");
            self.emit(DbEvent::Failover {
                cause: FailoverCause::Recovered,
                target: "primary".to_string(),
            });
            return;
        }

        for slot in &self.replicas {
            if slot.healthy.load(Ordering::Acquire) && self.probe(&slot.node).await {
                let mut selection = self.selection.write().await;
                selection.primary = slot.node.clone();
                drop(selection);
                warn!(promoted = slot.node.label(), "primary failed, replica promoted");
                self.emit(DbEvent::Failover {
                    cause: FailoverCause::PrimaryFailure,
                    target: format!("replica-{}", slot.index),
                });
                return;
            }
        }

        warn!("failover found no healthy node");
        self.emit(DbEvent::Failover {
            cause: FailoverCause::AllUnhealthy,
            target: "none".to_string(),
        });
    }

    async fn probe(&self, node: &Arc<dyn DbNode>) -> bool {
        tokio::time::timeout(self.options.probe_timeout, node.probe())
            .await
            .unwrap_or(false)
    }

    // ── Health checks ──────────────────────────────────────────────

    /// Probe the primary once and report a health-change event when the
    /// observed state flips.
    pub async fn check_primary_once(&self, last_healthy: &mut bool) {
        let healthy = self.probe(&self.primary).await;
        if healthy != *last_healthy {
            *last_healthy = healthy;
            if !healthy {
                warn!("primary connection is unhealthy");
            }
            self.emit(DbEvent::HealthChange {
                component: "primary".to_string(),
                healthy,
            });
        }
    }

    /// Probe every replica once; flip flags only on observed change and
    /// refresh the current-replica selection.
    pub async fn check_replicas_once(&self) {
        let mut changed = false;
        for slot in &self.replicas {
            let healthy = self.probe(&slot.node).await;
            if slot.healthy.swap(healthy, Ordering::AcqRel) != healthy {
                changed = true;
                self.emit(DbEvent::HealthChange {
                    component: format!("replica-{}", slot.index),
                    healthy,
                });
            }
        }
        if changed {
            self.refresh_replica_selection().await;
        }
    }

    /// Point reads at the first healthy replica, or none.
    async fn refresh_replica_selection(&self) {
        let next = self
            .replicas
            .iter()
            .find(|s| s.healthy.load(Ordering::Acquire))
            .map(|s| s.node.clone());

        let mut selection = self.selection.write().await;
        selection.replica = next;
        debug!(
            replica = selection.replica.as_ref().map(|n| n.label().to_string()),
            "replica selection refreshed"
        );
    }

    /// Spawn the periodic health-check tasks (primary and replicas on
    /// separate intervals). Idempotent only in the sense that calling
    /// twice spawns twice; the daemon calls it once.
    pub fn spawn_health_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("health task registry poisoned");

        let manager = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut last_healthy = true;
            let mut ticker = tokio::time::interval(manager.options.primary_health_interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.check_primary_once(&mut last_healthy).await,
                    _ = shutdown.changed() => break,
                }
            }
        }));

        if !self.replicas.is_empty() {
            let manager = self.clone();
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(manager.options.replica_health_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => manager.check_replicas_once().await,
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        debug!("health-check tasks started");
    }

    // ── Shutdown ───────────────────────────────────────────────────

    /// Stop health checks and close every pool, primary first. Queries
    /// issued after this fail with `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("health task registry poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
        }

        // Hold the write lock so no query routes through a closing pool.
        let mut selection = self.selection.write().await;
        selection.replica = None;

        self.primary.close().await;
        for slot in &self.replicas {
            slot.node.close().await;
        }
        info!("connection manager closed");
    }

    fn emit(&self, event: DbEvent) {
        if self.events.try_send(event).is_err() {
            warn!("db event channel full, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    /// Scripted node: fails the first `fail_first` queries, then
    /// succeeds; probe result is flippable.
    struct MockNode {
        label: String,
        fail_first: AtomicU32,
        probe_ok: AtomicBool,
        queries: AtomicUsize,
        closed: AtomicBool,
    }

    impl MockNode {
        fn healthy(label: &str) -> Arc<Self> {
            Self::failing_first(label, 0)
        }

        fn failing_first(label: &str, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                label: label.to_string(),
                fail_first: AtomicU32::new(failures),
                probe_ok: AtomicBool::new(true),
                queries: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            })
        }

        fn dead(label: &str) -> Arc<Self> {
            let node = Self::failing_first(label, u32::MAX);
            node.probe_ok.store(false, Ordering::Release);
            node
        }

        fn query_count(&self) -> usize {
            self.queries.load(Ordering::Acquire)
        }
    }

    #[async_trait]
    impl DbNode for MockNode {
        fn label(&self) -> &str {
            &self.label
        }

        async fn query(&self, _sql: &str, _params: &[SqlParam]) -> DbResult<QueryOutput> {
            self.queries.fetch_add(1, Ordering::AcqRel);
            let remaining = self.fail_first.load(Ordering::Acquire);
            if remaining > 0 {
                if remaining != u32::MAX {
                    self.fail_first.store(remaining - 1, Ordering::Release);
                }
                return Err(DbError::Query("connection refused".to_string()));
            }
            Ok(QueryOutput::default())
        }

        async fn probe(&self) -> bool {
            self.probe_ok.load(Ordering::Acquire)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    fn fast_options() -> ManagerOptions {
        ManagerOptions {
            backoff_base: Duration::from_millis(1),
            probe_timeout: Duration::from_millis(50),
            ..ManagerOptions::default()
        }
    }

    #[tokio::test]
    async fn routes_to_primary_by_default() {
        let primary = MockNode::healthy("primary");
        let replica = MockNode::healthy("replica-0");
        let (manager, _events) = ConnectionManager::from_nodes(
            primary.clone(),
            vec![replica.clone()],
            fast_options(),
        );

        manager
            .execute("SELECT 1", &[], QueryOptions::default())
            .await
            .unwrap();

        assert_eq!(primary.query_count(), 1);
        assert_eq!(replica.query_count(), 0);
    }

    #[tokio::test]
    async fn routes_reads_to_replica_when_requested() {
        let primary = MockNode::healthy("primary");
        let replica = MockNode::healthy("replica-0");
        let (manager, _events) = ConnectionManager::from_nodes(
            primary.clone(),
            vec![replica.clone()],
            fast_options(),
        );

        manager
            .execute("SELECT 1", &[], QueryOptions::replica())
            .await
            .unwrap();

        assert_eq!(primary.query_count(), 0);
        assert_eq!(replica.query_count(), 1);
    }

    #[tokio::test]
    async fn replica_reads_fall_back_to_primary_without_replicas() {
        let primary = MockNode::healthy("primary");
        let (manager, _events) =
            ConnectionManager::from_nodes(primary.clone(), vec![], fast_options());

        manager
            .execute("SELECT 1", &[], QueryOptions::replica())
            .await
            .unwrap();
        assert_eq!(primary.query_count(), 1);
    }

    #[tokio::test]
    async fn retries_with_backoff_then_succeeds() {
        let primary = MockNode::failing_first("primary", 2);
        let (manager, _events) =
            ConnectionManager::from_nodes(primary.clone(), vec![], fast_options());

        manager
            .execute("SELECT 1", &[], QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(primary.query_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_connection_error() {
        let primary = MockNode::dead("primary");
        let (manager, _events) =
            ConnectionManager::from_nodes(primary.clone(), vec![], fast_options());

        let err = manager
            .execute("SELECT 1", &[], QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ConnectionFailed(_)));
        assert_eq!(primary.query_count(), 3);
    }

    #[tokio::test]
    async fn failover_promotes_healthy_replica() {
        let primary = MockNode::dead("primary");
        let replica = MockNode::healthy("replica-0");
        let (manager, mut events) = ConnectionManager::from_nodes(
            primary.clone(),
            vec![replica.clone()],
            fast_options(),
        );

        // First call exhausts retries against the dead primary and
        // triggers failover.
        let err = manager
            .execute("SELECT 1", &[], QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ConnectionFailed(_)));

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            DbEvent::Failover {
                cause: FailoverCause::PrimaryFailure,
                target: "replica-0".to_string(),
            }
        );

        // Retried call now succeeds through the promoted replica.
        manager
            .execute("SELECT 1", &[], QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(replica.query_count(), 1);
    }

    #[tokio::test]
    async fn failover_prefers_recovered_primary() {
        // Queries fail twice (transient), probe stays healthy, so the
        // failover check restores the primary rather than promoting.
        let primary = MockNode::failing_first("primary", 3);
        let replica = MockNode::healthy("replica-0");
        let (manager, mut events) =
            ConnectionManager::from_nodes(primary.clone(), vec![replica], fast_options());

        let _ = manager
            .execute("SELECT 1", &[], QueryOptions::default())
            .await
            .unwrap_err();

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            DbEvent::Failover {
                cause: FailoverCause::Recovered,
                target: "primary".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn failover_with_no_healthy_node_leaves_routing_unchanged() {
        let primary = MockNode::dead("primary");
        let replica = MockNode::dead("replica-0");
        let (manager, mut events) = ConnectionManager::from_nodes(
            primary.clone(),
            vec![replica.clone()],
            fast_options(),
        );

        let _ = manager
            .execute("SELECT 1", &[], QueryOptions::default())
            .await
            .unwrap_err();

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            DbEvent::Failover {
                cause: FailoverCause::AllUnhealthy,
                target: "none".to_string(),
            }
        );

        // Still routed at the dead primary.
        let before = primary.query_count();
        let _ = manager
            .execute("SELECT 1", &[], QueryOptions::default())
            .await
            .unwrap_err();
        assert!(primary.query_count() > before);
    }

    #[tokio::test]
    async fn replica_health_change_emits_event_and_reroutes() {
        let primary = MockNode::healthy("primary");
        let replica = MockNode::healthy("replica-0");
        let (manager, mut events) = ConnectionManager::from_nodes(
            primary.clone(),
            vec![replica.clone()],
            fast_options(),
        );

        replica.probe_ok.store(false, Ordering::Release);
        manager.check_replicas_once().await;

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            DbEvent::HealthChange {
                component: "replica-0".to_string(),
                healthy: false,
            }
        );

        // Reads now route to the primary.
        manager
            .execute("SELECT 1", &[], QueryOptions::replica())
            .await
            .unwrap();
        assert_eq!(primary.query_count(), 1);
        assert_eq!(replica.query_count(), 0);

        // No repeat event while the state is unchanged.
        manager.check_replicas_once().await;
        assert!(events.try_recv().is_err());

        // Recovery flips it back.
        replica.probe_ok.store(true, Ordering::Release);
        manager.check_replicas_once().await;
        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            DbEvent::HealthChange {
                component: "replica-0".to_string(),
                healthy: true,
            }
        );
        manager
            .execute("SELECT 1", &[], QueryOptions::replica())
            .await
            .unwrap();
        assert_eq!(replica.query_count(), 1);
    }

    #[tokio::test]
    async fn primary_health_check_reports_flips_only() {
        let primary = MockNode::healthy("primary");
        let (manager, mut events) =
            ConnectionManager::from_nodes(primary.clone(), vec![], fast_options());

        let mut last = true;
        manager.check_primary_once(&mut last).await;
        assert!(events.try_recv().is_err());

        primary.probe_ok.store(false, Ordering::Release);
        manager.check_primary_once(&mut last).await;
        assert_eq!(
            events.recv().await.unwrap(),
            DbEvent::HealthChange {
                component: "primary".to_string(),
                healthy: false,
            }
        );
    }

    #[tokio::test]
    async fn close_closes_all_pools_and_rejects_queries() {
        let primary = MockNode::healthy("primary");
        let replica = MockNode::healthy("replica-0");
        let (manager, _events) = ConnectionManager::from_nodes(
            primary.clone(),
            vec![replica.clone()],
            fast_options(),
        );
        manager.spawn_health_tasks();

        manager.close().await;

        assert!(primary.closed.load(Ordering::Acquire));
        assert!(replica.closed.load(Ordering::Acquire));
        assert!(matches!(
            manager
                .execute("SELECT 1", &[], QueryOptions::default())
                .await,
            Err(DbError::Closed)
        ));

        // Second close is a no-op.
        manager.close().await;
    }
}
