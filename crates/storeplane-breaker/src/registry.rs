//! Breaker registry and the fallback policies.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BreakerConfig;
use crate::state::{Admission, BreakerCore, StateKind, Transition};

/// What a tripped breaker does instead of calling the dependency.
/// Bound once at registration; callers never choose per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Serve the last-known-good snapshot, marked stale. The snapshot
    /// map holds at most `max_snapshots` keys; admitting a new key at
    /// capacity evicts the oldest entry.
    CacheServe { max_snapshots: usize },
    /// Park the request in a bounded queue for later replay.
    QueueDefer { capacity: usize },
    /// Deny outright. For dependencies where a wrong answer is worse
    /// than no answer.
    FailClosed,
}

/// How a routed call resolved.
#[derive(Debug)]
pub enum FireOutcome<T> {
    Success(T),
    /// Served from the snapshot cache instead of the dependency.
    Stale {
        snapshot: Value,
        cached_at: DateTime<Utc>,
        retry_at: DateTime<Utc>,
    },
    /// Parked for replay once the dependency recovers.
    Queued { request_id: Uuid },
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("no breaker registered for dependency '{0}'")]
    UnknownDependency(String),
    #[error("dependency '{dependency}' unavailable: {detail}")]
    Unavailable { dependency: String, detail: String },
    #[error("security dependency '{dependency}' unavailable, failing closed")]
    SecurityUnavailable { dependency: String },
    #[error("deferred queue for dependency '{dependency}' is full")]
    QueueFull { dependency: String },
}

/// Transition and alert events, consumed by the daemon observability task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakerEvent {
    Opened { dependency: String },
    HalfOpened { dependency: String },
    Closed { dependency: String },
    SecurityFailClosed { dependency: String },
}

/// A write parked by the QueueDefer fallback. Replay is at-least-once;
/// consumers must tolerate duplicates.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedRequest {
    pub request_id: Uuid,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub dependency: String,
    pub state: StateKind,
    pub window_samples: usize,
    pub failure_rate_pct: f64,
    pub queue_depth: usize,
    pub snapshots: usize,
}

struct Snapshot {
    value: Value,
    cached_at: DateTime<Utc>,
}

struct Breaker {
    name: String,
    config: BreakerConfig,
    policy: FallbackPolicy,
    core: Mutex<BreakerCore>,
    // CacheServe snapshots, keyed so different reads never shadow
    // each other.
    snapshots: RwLock<HashMap<String, Snapshot>>,
    queue: Mutex<VecDeque<QueuedRequest>>,
}

/// Named breakers plus the shared event channel.
pub struct Registry {
    breakers: RwLock<HashMap<String, Arc<Breaker>>>,
    events: mpsc::Sender<BreakerEvent>,
}

impl Registry {
    pub fn new(event_capacity: usize) -> (Arc<Self>, mpsc::Receiver<BreakerEvent>) {
        let (tx, rx) = mpsc::channel(event_capacity);
        (
            Arc::new(Self {
                breakers: RwLock::new(HashMap::new()),
                events: tx,
            }),
            rx,
        )
    }

    /// Register a dependency. Re-registering replaces the breaker and
    /// resets its state.
    pub fn register(&self, name: &str, config: BreakerConfig, policy: FallbackPolicy) {
        let breaker = Arc::new(Breaker {
            name: name.to_string(),
            core: Mutex::new(BreakerCore::new(config.clone())),
            config,
            policy,
            snapshots: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
        });
        info!(dependency = name, policy = ?policy, "breaker registered");
        self.breakers
            .write()
            .expect("breaker map poisoned")
            .insert(name.to_string(), breaker);
    }

    fn lookup(&self, name: &str) -> Result<Arc<Breaker>, BreakerError> {
        self.breakers
            .read()
            .expect("breaker map poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| BreakerError::UnknownDependency(name.to_string()))
    }

    /// Route a call through the named breaker. The future must resolve
    /// to `Err` only for dependency faults; caller errors belong in the
    /// `Ok` value so they never count against the breaker.
    pub async fn fire<T, E, Fut>(&self, name: &str, fut: Fut) -> Result<FireOutcome<T>, BreakerError>
    where
        T: Serialize,
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        self.fire_inner(name, None, None, None, fut).await
    }

    /// Like [`fire`](Self::fire), with CacheServe participation: a
    /// success refreshes the snapshot stored under `cache_key`, and a
    /// tripped breaker serves that snapshot back as stale.
    pub async fn fire_cached<T, E, Fut>(
        &self,
        name: &str,
        cache_key: &str,
        fut: Fut,
    ) -> Result<FireOutcome<T>, BreakerError>
    where
        T: Serialize,
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        self.fire_inner(name, Some(cache_key), None, None, fut).await
    }

    /// Like [`fire_cached`](Self::fire_cached), but only refreshes the
    /// snapshot when `cacheable` approves the value. Callers whose `Ok`
    /// carries error replies keep those out of the cache this way.
    pub async fn fire_cached_if<T, E, Fut>(
        &self,
        name: &str,
        cache_key: &str,
        cacheable: fn(&T) -> bool,
        fut: Fut,
    ) -> Result<FireOutcome<T>, BreakerError>
    where
        T: Serialize,
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        self.fire_inner(name, Some(cache_key), Some(cacheable), None, fut)
            .await
    }

    /// Like [`fire`](Self::fire), for mutations: `payload` is what gets
    /// parked if the QueueDefer fallback engages.
    pub async fn fire_with_payload<T, E, Fut>(
        &self,
        name: &str,
        payload: Value,
        fut: Fut,
    ) -> Result<FireOutcome<T>, BreakerError>
    where
        T: Serialize,
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        self.fire_inner(name, None, None, Some(payload), fut).await
    }

    async fn fire_inner<T, E, Fut>(
        &self,
        name: &str,
        cache_key: Option<&str>,
        cacheable: Option<fn(&T) -> bool>,
        payload: Option<Value>,
        fut: Fut,
    ) -> Result<FireOutcome<T>, BreakerError>
    where
        T: Serialize,
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.lookup(name)?;

        let admission = {
            let mut core = breaker.core.lock().expect("breaker core poisoned");
            let (admission, transition) = core.begin(Instant::now());
            if let Some(t) = transition {
                self.publish(&breaker, t);
            }
            admission
        };

        let trial = match admission {
            Admission::Admit { trial } => trial,
            Admission::Reject { retry_in } => {
                debug!(dependency = %breaker.name, "open breaker rejected call");
                return self.fallback(&breaker, cache_key, payload, retry_in, "circuit open".to_string());
            }
        };

        match tokio::time::timeout(breaker.config.call_timeout, fut).await {
            Ok(Ok(value)) => {
                self.settle_success(&breaker, trial);
                if let FallbackPolicy::CacheServe { max_snapshots } = breaker.policy {
                    if let Some(key) = cache_key {
                        if cacheable.is_none_or(|keep| keep(&value)) {
                            match serde_json::to_value(&value) {
                                Ok(v) => breaker.update_snapshot(key, v, max_snapshots),
                                Err(e) => warn!(dependency = %breaker.name, error = %e, "snapshot serialization failed"),
                            }
                        }
                    }
                }
                Ok(FireOutcome::Success(value))
            }
            Ok(Err(e)) => {
                let detail = e.to_string();
                warn!(dependency = %breaker.name, error = %detail, "dependency call failed");
                self.settle_failure(&breaker, trial);
                self.fallback(&breaker, cache_key, payload, breaker.config.reset_timeout, detail)
            }
            Err(_) => {
                warn!(dependency = %breaker.name, "dependency call timed out");
                self.settle_failure(&breaker, trial);
                self.fallback(
                    &breaker,
                    cache_key,
                    payload,
                    breaker.config.reset_timeout,
                    "call timed out".to_string(),
                )
            }
        }
    }

    fn settle_success(&self, breaker: &Breaker, trial: bool) {
        let transition = {
            let mut core = breaker.core.lock().expect("breaker core poisoned");
            core.on_success(Instant::now(), trial)
        };
        if let Some(t) = transition {
            self.publish(breaker, t);
        }
    }

    fn settle_failure(&self, breaker: &Breaker, trial: bool) {
        let transition = {
            let mut core = breaker.core.lock().expect("breaker core poisoned");
            core.on_failure(Instant::now(), trial)
        };
        if let Some(t) = transition {
            self.publish(breaker, t);
        }
    }

    fn fallback<T>(
        &self,
        breaker: &Breaker,
        cache_key: Option<&str>,
        payload: Option<Value>,
        retry_in: Duration,
        detail: String,
    ) -> Result<FireOutcome<T>, BreakerError> {
        match breaker.policy {
            FallbackPolicy::CacheServe { .. } => {
                let guard = breaker.snapshots.read().expect("snapshot lock poisoned");
                match cache_key.and_then(|key| guard.get(key)) {
                    Some(snap) => {
                        info!(dependency = %breaker.name, "serving stale snapshot");
                        Ok(FireOutcome::Stale {
                            snapshot: snap.value.clone(),
                            cached_at: snap.cached_at,
                            retry_at: Utc::now()
                                + chrono::Duration::from_std(retry_in)
                                    .unwrap_or_else(|_| chrono::Duration::seconds(0)),
                        })
                    }
                    None => Err(BreakerError::Unavailable {
                        dependency: breaker.name.clone(),
                        detail,
                    }),
                }
            }
            FallbackPolicy::QueueDefer { capacity } => {
                let Some(payload) = payload else {
                    return Err(BreakerError::Unavailable {
                        dependency: breaker.name.clone(),
                        detail,
                    });
                };
                let mut queue = breaker.queue.lock().expect("defer queue poisoned");
                if queue.len() >= capacity {
                    warn!(dependency = %breaker.name, capacity, "defer queue full, rejecting");
                    return Err(BreakerError::QueueFull {
                        dependency: breaker.name.clone(),
                    });
                }
                let request_id = Uuid::new_v4();
                queue.push_back(QueuedRequest {
                    request_id,
                    payload,
                    enqueued_at: Utc::now(),
                });
                info!(dependency = %breaker.name, %request_id, depth = queue.len(), "request deferred");
                Ok(FireOutcome::Queued { request_id })
            }
            FallbackPolicy::FailClosed => {
                error!(dependency = %breaker.name, "failing closed");
                self.emit(BreakerEvent::SecurityFailClosed {
                    dependency: breaker.name.clone(),
                });
                Err(BreakerError::SecurityUnavailable {
                    dependency: breaker.name.clone(),
                })
            }
        }
    }

    /// Take everything parked for the named dependency. Called by the
    /// replayer when the circuit closes.
    pub fn drain_queued(&self, name: &str) -> Result<Vec<QueuedRequest>, BreakerError> {
        let breaker = self.lookup(name)?;
        let mut queue = breaker.queue.lock().expect("defer queue poisoned");
        Ok(queue.drain(..).collect())
    }

    pub fn status(&self, name: &str) -> Result<BreakerStatus, BreakerError> {
        Ok(self.lookup(name)?.status())
    }

    pub fn all_statuses(&self) -> Vec<BreakerStatus> {
        let breakers = self.breakers.read().expect("breaker map poisoned");
        let mut statuses: Vec<BreakerStatus> = breakers.values().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        statuses
    }

    fn publish(&self, breaker: &Breaker, transition: Transition) {
        let event = match transition {
            Transition::Opened => {
                warn!(dependency = %breaker.name, "circuit opened");
                BreakerEvent::Opened {
                    dependency: breaker.name.clone(),
                }
            }
            Transition::HalfOpened => {
                info!(dependency = %breaker.name, "circuit half-open, trial admitted");
                BreakerEvent::HalfOpened {
                    dependency: breaker.name.clone(),
                }
            }
            Transition::Closed => {
                info!(dependency = %breaker.name, "circuit closed");
                BreakerEvent::Closed {
                    dependency: breaker.name.clone(),
                }
            }
        };
        self.emit(event);
    }

    fn emit(&self, event: BreakerEvent) {
        if self.events.try_send(event).is_err() {
            warn!("breaker event channel full, event dropped");
        }
    }
}

impl Breaker {
    fn update_snapshot(&self, key: &str, value: Value, max_snapshots: usize) {
        let mut guard = self.snapshots.write().expect("snapshot lock poisoned");
        if !guard.contains_key(key) && guard.len() >= max_snapshots {
            let oldest = guard
                .iter()
                .min_by_key(|(_, snap)| snap.cached_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!(dependency = %self.name, key = %oldest, "snapshot cache full, evicting oldest");
                guard.remove(&oldest);
            }
        }
        guard.insert(
            key.to_string(),
            Snapshot {
                value,
                cached_at: Utc::now(),
            },
        );
    }

    fn status(&self) -> BreakerStatus {
        let core = self.core.lock().expect("breaker core poisoned");
        BreakerStatus {
            dependency: self.name.clone(),
            state: core.kind(),
            window_samples: core.sample_count(),
            failure_rate_pct: core.failure_rate(),
            queue_depth: self.queue.lock().expect("defer queue poisoned").len(),
            snapshots: self
                .snapshots
                .read()
                .expect("snapshot lock poisoned")
                .len(),
        }
    }
}
