//! REST API handlers.
//!
//! Handlers classify service errors before the breaker sees them:
//! caller mistakes (bad input, missing rows, stale versions) resolve to
//! normal HTTP errors inside the guarded future, so only dependency
//! faults count against the circuit.

use std::sync::atomic::Ordering;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use storeplane_breaker::{BreakerError, FireOutcome};
use storeplane_core::{EngineKind, StoreId};
use storeplane_stores::{CreateStoreRequest, StoreError, UpdateStoreRequest};
use uuid::Uuid;

use crate::{ApiState, SECURITY, STORE_READ, STORE_WRITE};

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        })
    }
}

fn error_response(msg: &str, code: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            code: Some(code.to_string()),
        }),
    )
        .into_response()
}

/// A settled HTTP result, serializable so CacheServe can snapshot it.
#[derive(Debug, serde::Serialize)]
struct Reply {
    status: u16,
    body: Value,
}

impl Reply {
    fn ok<T: serde::Serialize>(status: StatusCode, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(v) => Self {
                status: status.as_u16(),
                body: json!({ "success": true, "data": v }),
            },
            Err(e) => Self::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                &e.to_string(),
            ),
        }
    }

    fn error(status: StatusCode, code: &str, msg: &str) -> Self {
        Self {
            status: status.as_u16(),
            body: json!({ "success": false, "error": msg, "code": code }),
        }
    }

    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body)).into_response()
    }

    fn is_success(&self) -> bool {
        self.status < 400
    }
}

/// Deserialize a request body, surfacing an unknown engine tag as its
/// own error code instead of a generic deserialization failure.
fn parse_body<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, StoreError> {
    if let Some(engine) = body.pointer("/config/engine").and_then(Value::as_str) {
        engine
            .parse::<EngineKind>()
            .map_err(|_| StoreError::UnsupportedEngine(engine.to_string()))?;
    }
    serde_json::from_value(body)
        .map_err(|e| StoreError::Validation(format!("invalid request body: {e}")))
}

fn reply_for_error(e: &StoreError) -> Reply {
    let msg = e.to_string();
    match e {
        StoreError::Validation(_) => {
            Reply::error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", &msg)
        }
        StoreError::NotFound(_) => Reply::error(StatusCode::NOT_FOUND, "NOT_FOUND", &msg),
        StoreError::ConcurrencyConflict { .. } => {
            Reply::error(StatusCode::CONFLICT, "CONCURRENCY_ERROR", &msg)
        }
        StoreError::AlreadyExists(_) => Reply::error(StatusCode::CONFLICT, "ALREADY_EXISTS", &msg),
        StoreError::UnsupportedEngine(_) => {
            Reply::error(StatusCode::BAD_REQUEST, "UNSUPPORTED_ENGINE", &msg)
        }
        StoreError::Connection(_) => {
            Reply::error(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", &msg)
        }
        StoreError::Internal(_) => {
            Reply::error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", &msg)
        }
    }
}

fn breaker_response(e: &BreakerError) -> Response {
    match e {
        BreakerError::SecurityUnavailable { .. } => error_response(
            &e.to_string(),
            "SECURITY_SERVICE_UNAVAILABLE",
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        BreakerError::QueueFull { .. } | BreakerError::Unavailable { .. } => {
            error_response(&e.to_string(), "SERVICE_UNAVAILABLE", StatusCode::SERVICE_UNAVAILABLE)
        }
        BreakerError::UnknownDependency(_) => {
            error_response(&e.to_string(), "INTERNAL_ERROR", StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Unwrap a snapshotted `Reply` and attach staleness metadata.
fn stale_reply_response(
    snapshot: Value,
    cached_at: DateTime<Utc>,
    retry_at: DateTime<Utc>,
) -> Response {
    let status = snapshot
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|s| StatusCode::from_u16(s as u16).ok())
        .unwrap_or(StatusCode::OK);
    let mut body = snapshot.get("body").cloned().unwrap_or(Value::Null);
    if let Value::Object(map) = &mut body {
        map.insert(
            "meta".to_string(),
            json!({ "isStale": true, "cachedAt": cached_at, "retryAt": retry_at }),
        );
    }
    (status, Json(body)).into_response()
}

fn queued_response(request_id: Uuid) -> Response {
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(json!({ "requestId": request_id, "status": "queued" })),
    )
        .into_response()
}

fn actor_from(headers: &HeaderMap) -> String {
    headers
        .get("x-actor")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

/// Run the fail-closed security check for a mutating request.
async fn security_gate(state: &ApiState, actor: &str, action: &str) -> Result<(), Response> {
    let security = state.security.clone();
    let actor = actor.to_string();
    let action = action.to_string();
    let fut = async move { security.authorize(&actor, &action).await };

    match state.breakers.fire(SECURITY, fut).await {
        Ok(FireOutcome::Success(true)) => Ok(()),
        Ok(FireOutcome::Success(false)) => Err(error_response(
            "access denied",
            "ACCESS_DENIED",
            StatusCode::FORBIDDEN,
        )),
        Ok(_) => Err(error_response(
            "security check unavailable",
            "SECURITY_SERVICE_UNAVAILABLE",
            StatusCode::SERVICE_UNAVAILABLE,
        )),
        Err(e) => Err(breaker_response(&e)),
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(json!({
        "status": "ok",
        "breakers": state.breakers.all_statuses(),
    }))
}

/// GET /ready
pub async fn ready(State(state): State<ApiState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Acquire) {
        ApiResponse::ok(json!({ "status": "ready" })).into_response()
    } else {
        error_response("still starting", "NOT_READY", StatusCode::SERVICE_UNAVAILABLE)
    }
}

// ── Stores ─────────────────────────────────────────────────────

/// GET /api/stores
pub async fn list_stores(State(state): State<ApiState>) -> impl IntoResponse {
    let service = state.service.clone();
    let fut = async move { service.list().await };

    match state.breakers.fire_cached(STORE_READ, "stores:list", fut).await {
        Ok(FireOutcome::Success(stores)) => ApiResponse::ok(stores).into_response(),
        Ok(FireOutcome::Stale {
            snapshot,
            cached_at,
            retry_at,
        }) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": snapshot,
                "meta": { "isStale": true, "cachedAt": cached_at, "retryAt": retry_at },
            })),
        )
            .into_response(),
        Ok(FireOutcome::Queued { .. }) => error_response(
            "read unexpectedly deferred",
            "SERVICE_UNAVAILABLE",
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        Err(e) => breaker_response(&e),
    }
}

/// GET /api/stores/{id}
pub async fn get_store(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    // Malformed ids are rejected here; the snapshot cache is keyed by
    // the canonical id form only, and only success replies enter it.
    let store_id = match StoreId::parse(&id) {
        Ok(parsed) => parsed,
        Err(e) => {
            return error_response(&e.to_string(), "VALIDATION_ERROR", StatusCode::BAD_REQUEST)
        }
    };
    let service = state.service.clone();
    let key = format!("stores:get:{store_id}");
    let fut = async move {
        match service.get(&store_id.to_string()).await {
            Ok(store) => Ok(Reply::ok(StatusCode::OK, &store)),
            Err(e) if e.is_dependency_failure() => Err(e),
            Err(e) => Ok(reply_for_error(&e)),
        }
    };

    match state
        .breakers
        .fire_cached_if(STORE_READ, &key, Reply::is_success, fut)
        .await
    {
        Ok(FireOutcome::Success(reply)) => reply.into_response(),
        Ok(FireOutcome::Stale {
            snapshot,
            cached_at,
            retry_at,
        }) => stale_reply_response(snapshot, cached_at, retry_at),
        Ok(FireOutcome::Queued { .. }) => error_response(
            "read unexpectedly deferred",
            "SERVICE_UNAVAILABLE",
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        Err(e) => breaker_response(&e),
    }
}

/// POST /api/stores
pub async fn create_store(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let actor = actor_from(&headers);
    if let Err(denied) = security_gate(&state, &actor, "stores.create").await {
        return denied;
    }
    let request: CreateStoreRequest = match parse_body(body) {
        Ok(request) => request,
        Err(e) => return reply_for_error(&e).into_response(),
    };

    let payload = json!({ "op": "create", "actor": actor, "request": request });
    let service = state.service.clone();
    let fut = async move {
        match service.create(&actor, request).await {
            Ok(store) => Ok(Reply::ok(StatusCode::CREATED, &store)),
            Err(e) if e.is_dependency_failure() => Err(e),
            Err(e) => Ok(reply_for_error(&e)),
        }
    };

    match state
        .breakers
        .fire_with_payload(STORE_WRITE, payload, fut)
        .await
    {
        Ok(FireOutcome::Success(reply)) => reply.into_response(),
        Ok(FireOutcome::Queued { request_id }) => queued_response(request_id),
        Ok(FireOutcome::Stale { .. }) => error_response(
            "write unexpectedly served from cache",
            "SERVICE_UNAVAILABLE",
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        Err(e) => breaker_response(&e),
    }
}

/// PUT /api/stores/{id}
pub async fn update_store(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let actor = actor_from(&headers);
    if let Err(denied) = security_gate(&state, &actor, "stores.update").await {
        return denied;
    }
    let request: UpdateStoreRequest = match parse_body(body) {
        Ok(request) => request,
        Err(e) => return reply_for_error(&e).into_response(),
    };

    let payload = json!({ "op": "update", "actor": actor, "id": id, "request": request });
    let service = state.service.clone();
    let fut = async move {
        match service.update(&actor, &id, request).await {
            Ok(store) => Ok(Reply::ok(StatusCode::OK, &store)),
            Err(e) if e.is_dependency_failure() => Err(e),
            Err(e) => Ok(reply_for_error(&e)),
        }
    };

    match state
        .breakers
        .fire_with_payload(STORE_WRITE, payload, fut)
        .await
    {
        Ok(FireOutcome::Success(reply)) => reply.into_response(),
        Ok(FireOutcome::Queued { request_id }) => queued_response(request_id),
        Ok(FireOutcome::Stale { .. }) => error_response(
            "write unexpectedly served from cache",
            "SERVICE_UNAVAILABLE",
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        Err(e) => breaker_response(&e),
    }
}

/// DELETE /api/stores/{id}
pub async fn delete_store(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let actor = actor_from(&headers);
    if let Err(denied) = security_gate(&state, &actor, "stores.delete").await {
        return denied;
    }

    let payload = json!({ "op": "delete", "actor": actor, "id": id });
    let service = state.service.clone();
    let fut = async move {
        match service.delete(&actor, &id).await {
            Ok(store) => Ok(Reply::ok(StatusCode::OK, &store)),
            Err(e) if e.is_dependency_failure() => Err(e),
            Err(e) => Ok(reply_for_error(&e)),
        }
    };

    match state
        .breakers
        .fire_with_payload(STORE_WRITE, payload, fut)
        .await
    {
        Ok(FireOutcome::Success(reply)) => reply.into_response(),
        Ok(FireOutcome::Queued { request_id }) => queued_response(request_id),
        Ok(FireOutcome::Stale { .. }) => error_response(
            "write unexpectedly served from cache",
            "SERVICE_UNAVAILABLE",
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        Err(e) => breaker_response(&e),
    }
}
