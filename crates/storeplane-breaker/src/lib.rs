//! Circuit breakers for downstream dependencies.
//!
//! Each registered dependency gets its own rolling-window breaker and a
//! fallback policy fixed at registration time. Callers route work
//! through [`Registry::fire`]; a tripped breaker resolves through the
//! fallback (cached snapshot, deferred queue, or hard deny) instead of
//! hammering the dependency.

pub mod config;
pub mod registry;
pub mod state;

pub use config::BreakerConfig;
pub use registry::{
    BreakerError, BreakerEvent, BreakerStatus, FallbackPolicy, FireOutcome, QueuedRequest,
    Registry,
};
pub use state::StateKind;
