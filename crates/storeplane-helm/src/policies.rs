//! Tenant isolation policies applied to every store namespace.

use std::path::Path;

use tracing::{info, warn};

use crate::error::{HelmError, HelmResult};
use crate::runner::CommandRunner;

/// Applied in order: quotas and limits first, then default-deny, then
/// the narrow allows.
pub const POLICY_FILES: &[&str] = &[
    "resource-quota.yaml",
    "limit-range.yaml",
    "network-policy-default-deny.yaml",
    "network-policy-allow-dns.yaml",
    "network-policy-allow-engine.yaml",
    "network-policy-allow-database.yaml",
];

/// Substitute the namespace placeholder in a policy template.
pub fn render_policy(template: &str, namespace: &str) -> String {
    template.replace("{{ NAMESPACE }}", namespace)
}

/// Render and apply the full policy set to `namespace`. A missing
/// template file is logged and skipped; a render or apply failure is
/// fatal for the provisioning run.
pub async fn apply_isolation_policies(
    runner: &dyn CommandRunner,
    policy_dir: &Path,
    namespace: &str,
) -> HelmResult<()> {
    for file in POLICY_FILES {
        let path = policy_dir.join(file);
        if !path.exists() {
            warn!(policy = file, "isolation policy template missing, skipped");
            continue;
        }

        let template =
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| HelmError::IsolationPolicy {
                    file: file.to_string(),
                    detail: e.to_string(),
                })?;
        let manifest = render_policy(&template, namespace);

        let args = vec![
            "apply".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "-f".to_string(),
            "-".to_string(),
        ];
        let output = runner.run_with_stdin("kubectl", &args, &manifest).await?;
        if !output.success {
            return Err(HelmError::IsolationPolicy {
                file: file.to_string(),
                detail: output.stderr,
            });
        }
        info!(policy = file, namespace, "isolation policy applied");
    }
    Ok(())
}
