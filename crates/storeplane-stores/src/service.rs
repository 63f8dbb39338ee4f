//! The store lifecycle service.
//!
//! `create` answers immediately with the provisioning row and runs the
//! deployment workflow as a tracked background task; the task ends the
//! row in exactly one of `ready` or `failed`. All client input is
//! sanitized here before it touches storage or the orchestrator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use storeplane_core::{
    sanitize_json, sanitize_text, EngineKind, Store, StoreConfig, StoreId, StoreStatus,
};
use storeplane_helm::{HelmError, HelmOrchestrator, Provisioned};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::audit::{AuditAction, AuditRecord, AuditSink};
use crate::error::{StoreError, StoreResult};
use crate::repository::{StoreChanges, StoreRepository};

const NAME_MIN: usize = 3;
const NAME_MAX: usize = 100;

/// Deployment seam so service tests run without a cluster.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        id: &StoreId,
        subdomain: &str,
        engine: EngineKind,
    ) -> Result<Provisioned, HelmError>;

    async fn uninstall(&self, id: &StoreId) -> Result<(), HelmError>;
}

#[async_trait]
impl Provisioner for HelmOrchestrator {
    async fn provision(
        &self,
        id: &StoreId,
        subdomain: &str,
        engine: EngineKind,
    ) -> Result<Provisioned, HelmError> {
        HelmOrchestrator::provision(self, id, subdomain, engine).await
    }

    async fn uninstall(&self, id: &StoreId) -> Result<(), HelmError> {
        HelmOrchestrator::uninstall(self, id).await
    }
}

/// Admission hook for create requests. Quota and rate policies plug in
/// here; the default admits everything.
pub trait CreateGate: Send + Sync {
    fn admit(&self, actor: &str) -> Result<(), String>;
}

pub struct AllowAll;

impl CreateGate for AllowAll {
    fn admit(&self, _actor: &str) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CreateStoreRequest {
    pub name: String,
    pub config: StoreConfig,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UpdateStoreRequest {
    /// Version the caller read; the update applies only if it still
    /// matches.
    pub version: i64,
    pub name: Option<String>,
    pub status: Option<StoreStatus>,
    pub config: Option<StoreConfig>,
}

pub struct StoreService {
    repo: Arc<dyn StoreRepository>,
    provisioner: Arc<dyn Provisioner>,
    audit: Arc<dyn AuditSink>,
    gate: Arc<dyn CreateGate>,
    tasks: Arc<Mutex<HashMap<StoreId, JoinHandle<()>>>>,
}

impl StoreService {
    pub fn new(
        repo: Arc<dyn StoreRepository>,
        provisioner: Arc<dyn Provisioner>,
        audit: Arc<dyn AuditSink>,
        gate: Arc<dyn CreateGate>,
    ) -> Self {
        Self {
            repo,
            provisioner,
            audit,
            gate,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // ── Create ─────────────────────────────────────────────────────

    /// Insert the provisioning row and kick off deployment. The caller
    /// gets the row back immediately; the workflow settles it later.
    pub async fn create(&self, actor: &str, request: CreateStoreRequest) -> StoreResult<Store> {
        self.gate
            .admit(actor)
            .map_err(StoreError::Validation)?;

        let name = sanitize_text(&request.name)
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        if name.chars().count() < NAME_MIN || name.chars().count() > NAME_MAX {
            return Err(StoreError::Validation(format!(
                "store name must be {NAME_MIN} to {NAME_MAX} characters"
            )));
        }
        let config = sanitize_config(&request.config)?;
        validate_subdomain(config.subdomain())?;

        let now = Utc::now();
        let store = Store {
            id: StoreId::generate(),
            name,
            status: StoreStatus::Provisioning,
            engine: config.engine(),
            config,
            version: 1,
            url: None,
            namespace: None,
            created_at: now,
            updated_at: now,
            decommissioned_at: None,
        };
        self.repo.insert(&store).await?;
        info!(id = %store.id, name = %store.name, engine = %store.engine, "store created");

        self.audit
            .record(AuditRecord::store(
                actor,
                AuditAction::Create,
                &store.id.to_string(),
                Some(&store.name),
            ))
            .await;

        self.spawn_provisioning(actor.to_string(), store.clone());
        Ok(store)
    }

    fn spawn_provisioning(&self, actor: String, store: Store) {
        let repo = self.repo.clone();
        let provisioner = self.provisioner.clone();
        let audit = self.audit.clone();
        let tasks = self.tasks.clone();
        let id = store.id;

        // The task's self-removal contends on this same lock, so the
        // handle is registered before the task can clean itself up,
        // even if it finishes instantly.
        let mut registry = self.tasks.lock().expect("task registry poisoned");
        let handle = tokio::spawn(async move {
            let subdomain = store.config.subdomain().to_string();
            match provisioner.provision(&id, &subdomain, store.engine).await {
                Ok(outcome) => {
                    match repo.mark_ready(&id, &outcome.url, &outcome.namespace).await {
                        Ok(true) => info!(%id, url = %outcome.url, "store ready"),
                        Ok(false) => {
                            // Row left provisioning state while we were
                            // deploying; nothing to settle.
                            warn!(%id, "ready transition skipped, store no longer provisioning")
                        }
                        Err(e) => error!(%id, error = %e, "ready transition failed"),
                    }
                }
                Err(e) => {
                    error!(%id, error = %e, "provisioning workflow failed");
                    match repo.mark_failed(&id).await {
                        Ok(_) => {}
                        Err(db) => error!(%id, error = %db, "failed transition not recorded"),
                    }
                    audit
                        .record(
                            AuditRecord::store(
                                &actor,
                                AuditAction::FailedCreate,
                                &id.to_string(),
                                Some(&store.name),
                            )
                            .with_detail("error", Value::String(e.to_string())),
                        )
                        .await;
                }
            }
            tasks.lock().expect("task registry poisoned").remove(&id);
        });
        registry.insert(id, handle);
    }

    /// Number of provisioning workflows still tracked.
    pub fn active_workflows(&self) -> usize {
        self.tasks.lock().expect("task registry poisoned").len()
    }

    /// Await the background workflow for a store, if one is running.
    /// Used by tests and shutdown; normal callers never block on it.
    pub async fn wait_for_provisioning(&self, id: &StoreId) {
        let handle = self
            .tasks
            .lock()
            .expect("task registry poisoned")
            .remove(id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Abort every in-flight workflow. Rows stuck in `provisioning`
    /// after an abort are settled by operators, not by this process.
    pub fn abort_workflows(&self) {
        let mut tasks = self.tasks.lock().expect("task registry poisoned");
        for (id, handle) in tasks.drain() {
            warn!(%id, "aborting provisioning workflow");
            handle.abort();
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub async fn get(&self, id: &str) -> StoreResult<Store> {
        let id = parse_id(id)?;
        match self.repo.get(&id).await? {
            Some(store) if !store.is_decommissioned() => Ok(store),
            _ => Err(StoreError::NotFound(id.to_string())),
        }
    }

    pub async fn list(&self) -> StoreResult<Vec<Store>> {
        self.repo.list().await
    }

    // ── Update ─────────────────────────────────────────────────────

    pub async fn update(
        &self,
        actor: &str,
        id: &str,
        request: UpdateStoreRequest,
    ) -> StoreResult<Store> {
        let id = parse_id(id)?;
        let current = match self.repo.get(&id).await? {
            Some(store) if !store.is_decommissioned() => store,
            _ => return Err(StoreError::NotFound(id.to_string())),
        };

        if let Some(next) = request.status {
            if !current.status.can_transition_to(next) {
                return Err(StoreError::Validation(format!(
                    "status cannot move from {} to {}",
                    current.status.as_str(),
                    next.as_str()
                )));
            }
        }

        let mut changes = StoreChanges {
            status: request.status,
            ..StoreChanges::default()
        };
        if let Some(name) = &request.name {
            let name = sanitize_text(name).map_err(|e| StoreError::Validation(e.to_string()))?;
            if name.chars().count() < NAME_MIN || name.chars().count() > NAME_MAX {
                return Err(StoreError::Validation(format!(
                    "store name must be {NAME_MIN} to {NAME_MAX} characters"
                )));
            }
            changes.name = Some(name);
        }
        if let Some(config) = &request.config {
            if config.engine() != current.engine {
                return Err(StoreError::Validation(
                    "store engine cannot be changed".to_string(),
                ));
            }
            let config = sanitize_config(config)?;
            validate_subdomain(config.subdomain())?;
            changes.config = Some(config);
        }
        if changes.is_empty() {
            return Err(StoreError::Validation("no fields to update".to_string()));
        }

        let updated = self
            .repo
            .update(&id, request.version, &changes)
            .await?
            .ok_or(StoreError::ConcurrencyConflict {
                id,
                expected_version: request.version,
            })?;

        self.audit
            .record(AuditRecord::store(
                actor,
                AuditAction::Update,
                &id.to_string(),
                Some(&updated.name),
            ))
            .await;
        Ok(updated)
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Soft delete: remove the deployment, then stamp the row and hand
    /// back its final state. Deleting a missing or already-decommissioned
    /// store is NotFound, and the row is untouched.
    pub async fn delete(&self, actor: &str, id: &str) -> StoreResult<Store> {
        let id = parse_id(id)?;
        let current = match self.repo.get(&id).await? {
            Some(store) if !store.is_decommissioned() => store,
            _ => return Err(StoreError::NotFound(id.to_string())),
        };
        if !current.status.can_transition_to(StoreStatus::Decommissioned) {
            return Err(StoreError::Validation(format!(
                "store in status {} cannot be decommissioned",
                current.status.as_str()
            )));
        }

        if let Err(e) = self.provisioner.uninstall(&id).await {
            self.audit
                .record(
                    AuditRecord::store(
                        actor,
                        AuditAction::FailedDelete,
                        &id.to_string(),
                        Some(&current.name),
                    )
                    .with_detail("error", Value::String(e.to_string())),
                )
                .await;
            return Err(StoreError::Internal(format!(
                "deployment removal failed: {e}"
            )));
        }

        match self.repo.decommission(&id).await? {
            Some(store) => {
                info!(%id, "store decommissioned");
                self.audit
                    .record(AuditRecord::store(
                        actor,
                        AuditAction::Delete,
                        &id.to_string(),
                        Some(&current.name),
                    ))
                    .await;
                Ok(store)
            }
            // Lost a race with another delete.
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }
}

// ── Input validation ───────────────────────────────────────────────

fn parse_id(raw: &str) -> StoreResult<StoreId> {
    StoreId::parse(raw).map_err(|e| StoreError::Validation(e.to_string()))
}

fn sanitize_config(config: &StoreConfig) -> StoreResult<StoreConfig> {
    let value =
        serde_json::to_value(config).map_err(|e| StoreError::Internal(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(StoreError::Internal(
            "store config did not serialize to an object".to_string(),
        ));
    };
    let cleaned = sanitize_json(&map).map_err(|e| StoreError::Validation(e.to_string()))?;
    serde_json::from_value(Value::Object(cleaned))
        .map_err(|e| StoreError::Validation(format!("invalid store config: {e}")))
}

fn validate_subdomain(subdomain: &str) -> StoreResult<()> {
    let valid = !subdomain.is_empty()
        && subdomain.len() <= 63
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::Validation(format!(
            "invalid subdomain: {subdomain}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicBool, Ordering};

    // ── In-memory fixtures ─────────────────────────────────────────

    #[derive(Default)]
    struct MemRepo {
        rows: Mutex<HashMap<StoreId, Store>>,
    }

    impl MemRepo {
        fn row(&self, id: &StoreId) -> Option<Store> {
            self.rows.lock().unwrap().get(id).cloned()
        }
    }

    #[async_trait]
    impl StoreRepository for MemRepo {
        async fn insert(&self, store: &Store) -> StoreResult<()> {
            self.rows.lock().unwrap().insert(store.id, store.clone());
            Ok(())
        }

        async fn get(&self, id: &StoreId) -> StoreResult<Option<Store>> {
            Ok(self.row(id))
        }

        async fn list(&self) -> StoreResult<Vec<Store>> {
            let mut rows: Vec<Store> = self
                .rows
                .lock()
                .unwrap()
                .values()
                .filter(|s| !s.is_decommissioned())
                .cloned()
                .collect();
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(rows)
        }

        async fn update(
            &self,
            id: &StoreId,
            expected_version: i64,
            changes: &StoreChanges,
        ) -> StoreResult<Option<Store>> {
            let mut rows = self.rows.lock().unwrap();
            let Some(store) = rows.get_mut(id) else {
                return Ok(None);
            };
            if store.version != expected_version {
                return Ok(None);
            }
            if let Some(name) = &changes.name {
                store.name = name.clone();
            }
            if let Some(status) = changes.status {
                store.status = status;
            }
            if let Some(config) = &changes.config {
                store.config = config.clone();
            }
            store.version += 1;
            store.updated_at = Utc::now();
            Ok(Some(store.clone()))
        }

        async fn mark_ready(
            &self,
            id: &StoreId,
            url: &str,
            namespace: &str,
        ) -> StoreResult<bool> {
            let mut rows = self.rows.lock().unwrap();
            let Some(store) = rows.get_mut(id) else {
                return Ok(false);
            };
            if store.status != StoreStatus::Provisioning {
                return Ok(false);
            }
            store.status = StoreStatus::Ready;
            store.url = Some(url.to_string());
            store.namespace = Some(namespace.to_string());
            store.version += 1;
            Ok(true)
        }

        async fn mark_failed(&self, id: &StoreId) -> StoreResult<bool> {
            let mut rows = self.rows.lock().unwrap();
            let Some(store) = rows.get_mut(id) else {
                return Ok(false);
            };
            if store.status != StoreStatus::Provisioning {
                return Ok(false);
            }
            store.status = StoreStatus::Failed;
            store.version += 1;
            Ok(true)
        }

        async fn decommission(&self, id: &StoreId) -> StoreResult<Option<Store>> {
            let mut rows = self.rows.lock().unwrap();
            let Some(store) = rows.get_mut(id) else {
                return Ok(None);
            };
            if store.status != StoreStatus::Ready || store.is_decommissioned() {
                return Ok(None);
            }
            store.status = StoreStatus::Decommissioned;
            store.decommissioned_at = Some(Utc::now());
            store.version += 1;
            Ok(Some(store.clone()))
        }
    }

    struct MockProvisioner {
        fail: AtomicBool,
        hold: Option<Arc<tokio::sync::Notify>>,
        uninstalled: Mutex<Vec<StoreId>>,
    }

    impl MockProvisioner {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
                hold: None,
                uninstalled: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(true),
                hold: None,
                uninstalled: Mutex::new(Vec::new()),
            })
        }

        /// Blocks each provision call until the returned notify fires.
        fn held() -> (Arc<Self>, Arc<tokio::sync::Notify>) {
            let notify = Arc::new(tokio::sync::Notify::new());
            let p = Arc::new(Self {
                fail: AtomicBool::new(false),
                hold: Some(notify.clone()),
                uninstalled: Mutex::new(Vec::new()),
            });
            (p, notify)
        }
    }

    #[async_trait]
    impl Provisioner for MockProvisioner {
        async fn provision(
            &self,
            id: &StoreId,
            subdomain: &str,
            _engine: EngineKind,
        ) -> Result<Provisioned, HelmError> {
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            if self.fail.load(Ordering::Acquire) {
                return Err(HelmError::Install("cluster rejected chart".to_string()));
            }
            Ok(Provisioned {
                namespace: format!("store-{id}"),
                url: format!("https://{subdomain}.shops.example"),
            })
        }

        async fn uninstall(&self, id: &StoreId) -> Result<(), HelmError> {
            self.uninstalled.lock().unwrap().push(*id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CaptureAudit {
        records: Mutex<Vec<AuditRecord>>,
    }

    impl CaptureAudit {
        fn actions(&self) -> Vec<AuditAction> {
            self.records.lock().unwrap().iter().map(|r| r.action).collect()
        }
    }

    #[async_trait]
    impl AuditSink for CaptureAudit {
        async fn record(&self, record: AuditRecord) {
            self.records.lock().unwrap().push(record);
        }
    }

    fn service(
        repo: Arc<MemRepo>,
        provisioner: Arc<MockProvisioner>,
        audit: Arc<CaptureAudit>,
    ) -> StoreService {
        StoreService::new(repo, provisioner, audit, Arc::new(AllowAll))
    }

    fn create_request(name: &str, subdomain: &str) -> CreateStoreRequest {
        CreateStoreRequest {
            name: name.to_string(),
            config: StoreConfig::Woocommerce {
                subdomain: subdomain.to_string(),
                extra: Map::new(),
            },
        }
    }

    // ── Create ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_returns_provisioning_at_version_one() {
        let repo = Arc::new(MemRepo::default());
        let svc = service(repo, MockProvisioner::succeeding(), Arc::default());

        let store = svc
            .create("tester", create_request("Acme Shop", "acme"))
            .await
            .unwrap();
        assert_eq!(store.status, StoreStatus::Provisioning);
        assert_eq!(store.version, 1);
        assert!(store.url.is_none());
    }

    #[tokio::test]
    async fn successful_workflow_settles_the_row_ready() {
        let repo = Arc::new(MemRepo::default());
        let svc = service(repo.clone(), MockProvisioner::succeeding(), Arc::default());

        let store = svc
            .create("tester", create_request("Acme Shop", "acme"))
            .await
            .unwrap();
        svc.wait_for_provisioning(&store.id).await;

        let row = repo.row(&store.id).unwrap();
        assert_eq!(row.status, StoreStatus::Ready);
        assert_eq!(row.url.as_deref(), Some("https://acme.shops.example"));
        assert_eq!(row.namespace.as_deref(), Some(&*format!("store-{}", store.id)));
        assert_eq!(row.version, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finished_workflows_leave_no_tracked_tasks() {
        let repo = Arc::new(MemRepo::default());
        let svc = service(repo, MockProvisioner::succeeding(), Arc::default());

        // The workflow task can finish on the other worker before
        // create() returns; its handle must still get cleaned up.
        for i in 0..20 {
            svc.create("tester", create_request("Acme Shop", &format!("acme-{i}")))
                .await
                .unwrap();
        }
        for _ in 0..200 {
            if svc.active_workflows() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(svc.active_workflows(), 0);
    }

    #[tokio::test]
    async fn failed_workflow_settles_the_row_failed_and_audits() {
        let repo = Arc::new(MemRepo::default());
        let audit = Arc::new(CaptureAudit::default());
        let svc = service(repo.clone(), MockProvisioner::failing(), audit.clone());

        let store = svc
            .create("tester", create_request("Acme Shop", "acme"))
            .await
            .unwrap();
        svc.wait_for_provisioning(&store.id).await;

        let row = repo.row(&store.id).unwrap();
        assert_eq!(row.status, StoreStatus::Failed);
        assert_eq!(
            audit.actions(),
            vec![AuditAction::Create, AuditAction::FailedCreate]
        );
    }

    #[tokio::test]
    async fn create_round_trip_preserves_name_engine_subdomain() {
        let repo = Arc::new(MemRepo::default());
        let svc = service(repo, MockProvisioner::succeeding(), Arc::default());

        let store = svc
            .create("tester", create_request("Acme Shop", "acme"))
            .await
            .unwrap();
        let read = svc.get(&store.id.to_string()).await.unwrap();
        assert_eq!(read.name, "Acme Shop");
        assert_eq!(read.engine, EngineKind::Woocommerce);
        assert_eq!(read.config.subdomain(), "acme");
    }

    #[tokio::test]
    async fn create_rejects_bad_names() {
        let repo = Arc::new(MemRepo::default());
        let svc = service(repo, MockProvisioner::succeeding(), Arc::default());

        let too_short = svc.create("tester", create_request("ab", "acme")).await;
        assert!(matches!(too_short, Err(StoreError::Validation(_))));

        let too_long = svc
            .create("tester", create_request(&"x".repeat(101), "acme"))
            .await;
        assert!(matches!(too_long, Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn create_sanitizes_markup_and_injection_keys() {
        let repo = Arc::new(MemRepo::default());
        let svc = service(repo, MockProvisioner::succeeding(), Arc::default());

        let mut extra = Map::new();
        extra.insert("__proto__".to_string(), json!({"polluted": true}));
        extra.insert("theme".to_string(), json!("<b>dark</b>"));
        let store = svc
            .create(
                "tester",
                CreateStoreRequest {
                    name: "Acme <script>alert(1)</script> Shop".to_string(),
                    config: StoreConfig::Woocommerce {
                        subdomain: "acme".to_string(),
                        extra,
                    },
                },
            )
            .await
            .unwrap();

        assert_eq!(store.name, "Acme alert(1) Shop");
        let StoreConfig::Woocommerce { extra, .. } = &store.config else {
            panic!("engine changed during sanitize");
        };
        assert!(!extra.contains_key("__proto__"));
        assert_eq!(extra.get("theme"), Some(&json!("dark")));
    }

    #[tokio::test]
    async fn create_rejects_bad_subdomains() {
        let repo = Arc::new(MemRepo::default());
        let svc = service(repo, MockProvisioner::succeeding(), Arc::default());

        for subdomain in ["", "-acme", "acme-", "Acme", "a b"] {
            let result = svc
                .create("tester", create_request("Acme Shop", subdomain))
                .await;
            assert!(
                matches!(result, Err(StoreError::Validation(_))),
                "subdomain {subdomain:?} was accepted"
            );
        }
    }

    struct DenyAll;

    impl CreateGate for DenyAll {
        fn admit(&self, _actor: &str) -> Result<(), String> {
            Err("quota exhausted".to_string())
        }
    }

    #[tokio::test]
    async fn create_gate_can_deny() {
        let svc = StoreService::new(
            Arc::new(MemRepo::default()),
            MockProvisioner::succeeding(),
            Arc::new(CaptureAudit::default()),
            Arc::new(DenyAll),
        );
        let result = svc.create("tester", create_request("Acme Shop", "acme")).await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    // ── Reads ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn get_validates_id_format_before_storage() {
        let svc = service(
            Arc::new(MemRepo::default()),
            MockProvisioner::succeeding(),
            Arc::default(),
        );
        assert!(matches!(
            svc.get("not-a-uuid").await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            svc.get(&StoreId::generate().to_string()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    // ── Update ─────────────────────────────────────────────────────

    async fn ready_store(svc: &StoreService) -> Store {
        let store = svc
            .create("tester", create_request("Acme Shop", "acme"))
            .await
            .unwrap();
        svc.wait_for_provisioning(&store.id).await;
        svc.get(&store.id.to_string()).await.unwrap()
    }

    #[tokio::test]
    async fn update_applies_and_bumps_version_by_one() {
        let repo = Arc::new(MemRepo::default());
        let svc = service(repo, MockProvisioner::succeeding(), Arc::default());
        let store = ready_store(&svc).await;

        let updated = svc
            .update(
                "tester",
                &store.id.to_string(),
                UpdateStoreRequest {
                    version: store.version,
                    name: Some("Acme Rebranded".to_string()),
                    status: None,
                    config: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Acme Rebranded");
        assert_eq!(updated.version, store.version + 1);
    }

    #[tokio::test]
    async fn stale_version_never_mutates() {
        let repo = Arc::new(MemRepo::default());
        let svc = service(repo.clone(), MockProvisioner::succeeding(), Arc::default());
        let store = ready_store(&svc).await;

        let result = svc
            .update(
                "tester",
                &store.id.to_string(),
                UpdateStoreRequest {
                    version: store.version - 1,
                    name: Some("Stale Writer".to_string()),
                    status: None,
                    config: None,
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { .. })
        ));

        let row = repo.row(&store.id).unwrap();
        assert_eq!(row.name, "Acme Shop");
        assert_eq!(row.version, store.version);
    }

    #[tokio::test]
    async fn update_rejects_backward_status_moves() {
        let repo = Arc::new(MemRepo::default());
        let svc = service(repo, MockProvisioner::succeeding(), Arc::default());
        let store = ready_store(&svc).await;

        let result = svc
            .update(
                "tester",
                &store.id.to_string(),
                UpdateStoreRequest {
                    version: store.version,
                    name: None,
                    status: Some(StoreStatus::Provisioning),
                    config: None,
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn update_rejects_engine_changes() {
        let repo = Arc::new(MemRepo::default());
        let svc = service(repo, MockProvisioner::succeeding(), Arc::default());
        let store = ready_store(&svc).await;

        let result = svc
            .update(
                "tester",
                &store.id.to_string(),
                UpdateStoreRequest {
                    version: store.version,
                    name: None,
                    status: None,
                    config: Some(StoreConfig::Medusa {
                        subdomain: "acme".to_string(),
                        extra: Map::new(),
                    }),
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    // ── Delete ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn delete_uninstalls_then_soft_deletes() {
        let repo = Arc::new(MemRepo::default());
        let provisioner = MockProvisioner::succeeding();
        let audit = Arc::new(CaptureAudit::default());
        let svc = service(repo.clone(), provisioner.clone(), audit.clone());
        let store = ready_store(&svc).await;

        let deleted = svc.delete("tester", &store.id.to_string()).await.unwrap();
        assert_eq!(deleted.status, StoreStatus::Decommissioned);
        assert!(deleted.decommissioned_at.is_some());
        assert_eq!(deleted.version, store.version + 1);

        assert_eq!(provisioner.uninstalled.lock().unwrap().as_slice(), &[store.id]);
        let row = repo.row(&store.id).unwrap();
        assert_eq!(row.status, StoreStatus::Decommissioned);
        assert!(row.decommissioned_at.is_some());
        assert!(audit.actions().contains(&AuditAction::Delete));
    }

    #[tokio::test]
    async fn repeated_delete_is_not_found_and_row_untouched() {
        let repo = Arc::new(MemRepo::default());
        let svc = service(repo.clone(), MockProvisioner::succeeding(), Arc::default());
        let store = ready_store(&svc).await;

        svc.delete("tester", &store.id.to_string()).await.unwrap();
        let after_first = repo.row(&store.id).unwrap();

        let second = svc.delete("tester", &store.id.to_string()).await;
        assert!(matches!(second, Err(StoreError::NotFound(_))));
        assert_eq!(repo.row(&store.id).unwrap(), after_first);
    }

    #[tokio::test]
    async fn provisioning_store_cannot_be_deleted() {
        let repo = Arc::new(MemRepo::default());
        let (provisioner, release) = MockProvisioner::held();
        let svc = service(repo, provisioner, Arc::default());
        let store = svc
            .create("tester", create_request("Acme Shop", "acme"))
            .await
            .unwrap();

        // Workflow is parked on the hold, so the row is still provisioning.
        let result = svc.delete("tester", &store.id.to_string()).await;
        assert!(matches!(result, Err(StoreError::Validation(_))));

        release.notify_one();
        svc.wait_for_provisioning(&store.id).await;
    }
}
