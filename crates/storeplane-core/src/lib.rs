//! storeplane-core — shared domain types for the storeplane control plane.
//!
//! Defines the `Store` entity and its lifecycle state machine, the closed
//! set of tenant engines, identifier parsing, input sanitizing, and the
//! daemon configuration. All other crates build on these types.

pub mod sanitize;
pub mod settings;
pub mod types;

pub use sanitize::{sanitize_json, sanitize_text, SanitizeError};
pub use settings::{DaemonSettings, Environment};
pub use types::*;
