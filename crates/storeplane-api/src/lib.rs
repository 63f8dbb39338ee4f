//! storeplane-api — REST surface of the control plane.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Liveness plus breaker statuses |
//! | GET | `/ready` | Readiness (serving once assembly finished) |
//! | GET | `/api/stores` | List live stores |
//! | POST | `/api/stores` | Create a store (returns the provisioning row) |
//! | GET | `/api/stores/{id}` | Get one store |
//! | PUT | `/api/stores/{id}` | Conditional update (caller supplies version) |
//! | DELETE | `/api/stores/{id}` | Decommission a store |
//!
//! Reads route through the `store-read` breaker (stale snapshots when
//! storage is down); mutations pass the fail-closed `security` gate and
//! the `store-write` breaker (deferred with 202 when storage is down).

pub mod handlers;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use storeplane_breaker::Registry;
use storeplane_stores::StoreService;

/// Breaker dependency names, registered by the daemon at startup.
pub const STORE_READ: &str = "store-read";
pub const STORE_WRITE: &str = "store-write";
pub const SECURITY: &str = "security";

/// Authorization decision for a mutating request. `Ok(false)` is a
/// plain deny; `Err` means the deciding service itself is failing and
/// counts against the security breaker.
#[async_trait]
pub trait SecurityCheck: Send + Sync {
    async fn authorize(&self, actor: &str, action: &str) -> Result<bool, String>;
}

/// Default check for deployments without an external decision point.
pub struct AllowAllSecurity;

#[async_trait]
impl SecurityCheck for AllowAllSecurity {
    async fn authorize(&self, _actor: &str, _action: &str) -> Result<bool, String> {
        Ok(true)
    }
}

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<StoreService>,
    pub breakers: Arc<Registry>,
    pub security: Arc<dyn SecurityCheck>,
    pub ready: Arc<AtomicBool>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/stores",
            get(handlers::list_stores).post(handlers::create_store),
        )
        .route(
            "/stores/{id}",
            get(handlers::get_store)
                .put(handlers::update_store)
                .delete(handlers::delete_store),
        )
        .with_state(state.clone());

    Router::new()
        .nest("/api", api_routes)
        .route("/health", get(handlers::health).with_state(state.clone()))
        .route("/ready", get(handlers::ready).with_state(state))
}
