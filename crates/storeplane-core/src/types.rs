//! Domain types for the store lifecycle.
//!
//! A `Store` is one isolated tenant instance deployed onto the shared
//! cluster. Its status moves forward only: provisioning ends in ready or
//! failed, and ready stores can be decommissioned (soft delete). The
//! `version` column is the optimistic-concurrency token — it increments
//! by exactly one on every successful mutation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Identifiers ────────────────────────────────────────────────────

/// Opaque store identifier in canonical hyphenated-hex form.
///
/// Assigned at creation, immutable afterwards. Parsing rejects anything
/// that is not the canonical `8-4-4-4-12` lowercase/uppercase hex form,
/// so malformed ids never reach storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(Uuid);

impl StoreId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an identifier in canonical hyphenated form.
    pub fn parse(s: &str) -> Result<Self, InvalidStoreId> {
        // Uuid::parse_str also accepts braced/simple forms; the API
        // contract only admits the hyphenated one.
        if s.len() != 36 {
            return Err(InvalidStoreId(s.to_string()));
        }
        let uuid = Uuid::parse_str(s).map_err(|_| InvalidStoreId(s.to_string()))?;
        Ok(Self(uuid))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Identifier did not match the canonical hyphenated-hex form.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid store id: {0}")]
pub struct InvalidStoreId(pub String);

// ── Status ─────────────────────────────────────────────────────────

/// Lifecycle status of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStatus {
    Provisioning,
    Ready,
    Failed,
    Decommissioned,
}

impl StoreStatus {
    /// Whether the forward-only state machine permits this transition.
    ///
    /// Provisioning → Ready | Failed; Ready → Decommissioned. Nothing
    /// moves backward and terminal states stay terminal.
    pub fn can_transition_to(self, next: StoreStatus) -> bool {
        use StoreStatus::*;
        matches!(
            (self, next),
            (Provisioning, Ready) | (Provisioning, Failed) | (Ready, Decommissioned)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StoreStatus::Provisioning => "provisioning",
            StoreStatus::Ready => "ready",
            StoreStatus::Failed => "failed",
            StoreStatus::Decommissioned => "decommissioned",
        }
    }
}

impl FromStr for StoreStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(StoreStatus::Provisioning),
            "ready" => Ok(StoreStatus::Ready),
            "failed" => Ok(StoreStatus::Failed),
            "decommissioned" => Ok(StoreStatus::Decommissioned),
            other => Err(format!("unknown store status: {other}")),
        }
    }
}

// ── Engines ────────────────────────────────────────────────────────

/// The closed set of tenant application engines this plane can deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Woocommerce,
    Medusa,
}

impl EngineKind {
    /// Chart directory name under the configured chart path.
    pub fn chart_dir(self) -> &'static str {
        match self {
            EngineKind::Woocommerce => "woocommerce",
            EngineKind::Medusa => "medusa",
        }
    }

    /// Suffix of the workload service created by the chart, appended to
    /// the release name.
    pub fn service_suffix(self) -> &'static str {
        match self {
            EngineKind::Woocommerce => "wordpress",
            EngineKind::Medusa => "medusa",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Woocommerce => "woocommerce",
            EngineKind::Medusa => "medusa",
        }
    }

    /// All engines managed by this control plane.
    pub fn all() -> &'static [EngineKind] {
        &[EngineKind::Woocommerce, EngineKind::Medusa]
    }
}

impl FromStr for EngineKind {
    type Err = UnsupportedEngine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "woocommerce" => Ok(EngineKind::Woocommerce),
            "medusa" => Ok(EngineKind::Medusa),
            other => Err(UnsupportedEngine(other.to_string())),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested engine is not in the supported set.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unsupported engine: {0}")]
pub struct UnsupportedEngine(pub String);

// ── Store configuration ────────────────────────────────────────────

/// Engine-scoped store configuration.
///
/// Tagged by engine kind with an explicit per-engine schema; genuinely
/// engine-specific extension fields land in the validated opaque `extra`
/// map rather than an open free-form blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "snake_case")]
pub enum StoreConfig {
    Woocommerce {
        subdomain: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },
    Medusa {
        subdomain: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },
}

impl StoreConfig {
    pub fn engine(&self) -> EngineKind {
        match self {
            StoreConfig::Woocommerce { .. } => EngineKind::Woocommerce,
            StoreConfig::Medusa { .. } => EngineKind::Medusa,
        }
    }

    pub fn subdomain(&self) -> &str {
        match self {
            StoreConfig::Woocommerce { subdomain, .. } => subdomain,
            StoreConfig::Medusa { subdomain, .. } => subdomain,
        }
    }
}

// ── Store entity ───────────────────────────────────────────────────

/// A tenant store and its full lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub id: StoreId,
    pub name: String,
    pub status: StoreStatus,
    pub config: StoreConfig,
    /// Optimistic-concurrency token. Starts at 1, +1 per mutation.
    pub version: i64,
    pub engine: EngineKind,
    pub url: Option<String>,
    pub namespace: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete stamp; the row is never physically removed.
    pub decommissioned_at: Option<DateTime<Utc>>,
}

impl Store {
    pub fn is_decommissioned(&self) -> bool {
        self.decommissioned_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_id_roundtrip() {
        let id = StoreId::generate();
        let parsed = StoreId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn store_id_rejects_malformed() {
        assert!(StoreId::parse("not-a-uuid").is_err());
        assert!(StoreId::parse("").is_err());
        // Simple (unhyphenated) form is rejected even though it is a
        // valid uuid encoding.
        assert!(StoreId::parse("9f86d081884c7d659a2feaa0c55ad015").is_err());
        // Braced form likewise.
        assert!(StoreId::parse("{9f86d081-884c-7d65-9a2f-eaa0c55ad015}").is_err());
    }

    #[test]
    fn status_transitions_forward_only() {
        use StoreStatus::*;
        assert!(Provisioning.can_transition_to(Ready));
        assert!(Provisioning.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Decommissioned));

        assert!(!Ready.can_transition_to(Provisioning));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Decommissioned.can_transition_to(Ready));
        assert!(!Failed.can_transition_to(Provisioning));
        assert!(!Provisioning.can_transition_to(Decommissioned));
    }

    #[test]
    fn engine_from_str() {
        assert_eq!("woocommerce".parse::<EngineKind>().unwrap(), EngineKind::Woocommerce);
        assert_eq!("medusa".parse::<EngineKind>().unwrap(), EngineKind::Medusa);
        assert!("shopify".parse::<EngineKind>().is_err());
    }

    #[test]
    fn config_wire_format() {
        let json = serde_json::json!({
            "engine": "woocommerce",
            "subdomain": "test-store",
            "theme": "storefront"
        });
        let config: StoreConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.engine(), EngineKind::Woocommerce);
        assert_eq!(config.subdomain(), "test-store");

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["engine"], "woocommerce");
        assert_eq!(back["theme"], "storefront");
    }

    #[test]
    fn status_serde_snake_case() {
        let s = serde_json::to_string(&StoreStatus::Provisioning).unwrap();
        assert_eq!(s, "\"provisioning\"");
        let parsed: StoreStatus = serde_json::from_str("\"decommissioned\"").unwrap();
        assert_eq!(parsed, StoreStatus::Decommissioned);
    }
}
