//! Helm release naming and status translation.

use serde::{Deserialize, Serialize};
use storeplane_core::{EngineKind, StoreId};

/// Release and namespace share one name per store.
pub fn release_name(id: &StoreId) -> String {
    format!("store-{id}")
}

/// Closed translation of helm's release status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseState {
    Deployed,
    PendingInstall,
    PendingUpgrade,
    Failed,
    Unknown,
}

impl ReleaseState {
    pub fn from_helm(status: &str) -> Self {
        match status {
            "deployed" => ReleaseState::Deployed,
            "pending-install" => ReleaseState::PendingInstall,
            "pending-upgrade" => ReleaseState::PendingUpgrade,
            "failed" => ReleaseState::Failed,
            _ => ReleaseState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseInfo {
    pub name: String,
    pub namespace: String,
    pub state: ReleaseState,
    pub chart: String,
}

/// Row shape of `helm list -o json`.
#[derive(Debug, Deserialize)]
struct HelmListRow {
    name: String,
    namespace: String,
    status: String,
    chart: String,
}

/// Parse `helm list -o json`, keeping only releases of charts this
/// daemon manages.
pub fn parse_release_list(json: &str) -> Result<Vec<ReleaseInfo>, serde_json::Error> {
    let rows: Vec<HelmListRow> = serde_json::from_str(json)?;
    Ok(rows
        .into_iter()
        .filter(|row| {
            EngineKind::all()
                .iter()
                .any(|engine| row.chart.starts_with(engine.chart_dir()))
        })
        .map(|row| ReleaseInfo {
            state: ReleaseState::from_helm(&row.status),
            name: row.name,
            namespace: row.namespace,
            chart: row.chart,
        })
        .collect())
}
