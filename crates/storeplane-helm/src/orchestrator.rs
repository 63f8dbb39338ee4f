//! The provisioning workflow: install, isolate, expose, and roll back
//! on failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use storeplane_core::{EngineKind, Environment, StoreId};
use tracing::{error, info, warn};

use crate::error::{HelmError, HelmResult};
use crate::policies::apply_isolation_policies;
use crate::release::{parse_release_list, release_name, ReleaseInfo, ReleaseState};
use crate::runner::CommandRunner;

/// Bounded polling loop parameters.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub attempts: u32,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub chart_path: PathBuf,
    pub policy_dir: PathBuf,
    pub domain: String,
    pub environment: Environment,
    pub install_timeout: String,
    /// Wait for the workload service to appear (local only). Exhaustion
    /// is fatal.
    pub service_poll: PollSettings,
    /// Wait for the ingress to appear (local only). Exhaustion is
    /// logged and tolerated.
    pub ingress_poll: PollSettings,
    pub hosts_file: PathBuf,
}

impl OrchestratorSettings {
    pub fn new(
        chart_path: PathBuf,
        policy_dir: PathBuf,
        domain: String,
        environment: Environment,
    ) -> Self {
        Self {
            chart_path,
            policy_dir,
            domain,
            environment,
            install_timeout: "10m".to_string(),
            service_poll: PollSettings {
                attempts: 30,
                interval: Duration::from_secs(6),
            },
            ingress_poll: PollSettings {
                attempts: 10,
                interval: Duration::from_secs(3),
            },
            hosts_file: PathBuf::from("/etc/hosts"),
        }
    }
}

/// What provisioning hands back for the store record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub namespace: String,
    pub url: String,
}

pub struct HelmOrchestrator {
    runner: Arc<dyn CommandRunner>,
    settings: OrchestratorSettings,
}

impl HelmOrchestrator {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: OrchestratorSettings) -> Self {
        Self { runner, settings }
    }

    /// Deploy a store release into its own namespace.
    ///
    /// The exists-check runs first so a duplicate id never triggers a
    /// rollback of the live release. Everything after it is
    /// compensated: on failure the release and namespace are removed
    /// and the original error comes back wrapped in
    /// `ProvisioningFailed`.
    pub async fn provision(
        &self,
        id: &StoreId,
        subdomain: &str,
        engine: EngineKind,
    ) -> HelmResult<Provisioned> {
        let release = release_name(id);

        let status = self
            .runner
            .run(
                "helm",
                &[
                    "status".to_string(),
                    release.clone(),
                    "-n".to_string(),
                    release.clone(),
                ],
            )
            .await?;
        if status.success {
            return Err(HelmError::AlreadyExists(release));
        }

        info!(%id, release, engine = engine.as_str(), "provisioning store");
        match self.install_and_expose(&release, subdomain, engine).await {
            Ok(url) => Ok(Provisioned {
                namespace: release,
                url,
            }),
            Err(e) => {
                error!(release, error = %e, "provisioning failed, rolling back");
                if let Err(cleanup) = self.remove_release(&release).await {
                    // The original failure matters more than the
                    // cleanup one.
                    warn!(release, error = %cleanup, "rollback cleanup incomplete");
                }
                Err(HelmError::ProvisioningFailed(Box::new(e)))
            }
        }
    }

    async fn install_and_expose(
        &self,
        release: &str,
        subdomain: &str,
        engine: EngineKind,
    ) -> HelmResult<String> {
        let chart_dir = self.settings.chart_path.join(engine.chart_dir());
        if !chart_dir.is_dir() {
            return Err(HelmError::ChartNotFound(chart_dir.display().to_string()));
        }

        let host = format!("{subdomain}.{}", self.settings.domain);
        let values = chart_dir.join(self.settings.environment.values_file());
        let install = self
            .runner
            .run(
                "helm",
                &[
                    "install".to_string(),
                    release.to_string(),
                    chart_dir.display().to_string(),
                    "-n".to_string(),
                    release.to_string(),
                    "--create-namespace".to_string(),
                    "--wait".to_string(),
                    format!("--timeout={}", self.settings.install_timeout),
                    "-f".to_string(),
                    values.display().to_string(),
                    "--set".to_string(),
                    format!("ingress.hostname={host}"),
                ],
            )
            .await?;
        if !install.success {
            if install.stderr.contains("timed out") {
                return Err(HelmError::ProvisionTimeout(release.to_string()));
            }
            return Err(HelmError::Install(install.stderr));
        }
        info!(release, "release installed");

        apply_isolation_policies(self.runner.as_ref(), &self.settings.policy_dir, release)
            .await?;

        self.derive_url(release, &host, engine).await
    }

    /// Production clusters have wildcard DNS; locally we wait for the
    /// service and ingress to materialize and pin the host in the
    /// hosts file.
    async fn derive_url(
        &self,
        release: &str,
        host: &str,
        engine: EngineKind,
    ) -> HelmResult<String> {
        if !self.settings.environment.is_local() {
            return Ok(format!("https://{host}"));
        }

        let service = format!("{release}-{}", engine.service_suffix());
        self.poll_resource("service", &service, release, self.settings.service_poll)
            .await
            .map_err(|_| {
                HelmError::UrlDerivation(format!("service {service} never became visible"))
            })?;

        if self
            .poll_resource("ingress", release, release, self.settings.ingress_poll)
            .await
            .is_err()
        {
            warn!(release, "ingress not visible after polling, continuing");
        }

        self.register_host(host).await;
        Ok(format!("http://{host}"))
    }

    /// Bounded retry around `kubectl get`. Returns Err on exhaustion;
    /// callers decide whether that is fatal.
    async fn poll_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        poll: PollSettings,
    ) -> Result<(), ()> {
        for attempt in 1..=poll.attempts {
            let result = self
                .runner
                .run(
                    "kubectl",
                    &[
                        "get".to_string(),
                        kind.to_string(),
                        name.to_string(),
                        "-n".to_string(),
                        namespace.to_string(),
                    ],
                )
                .await;
            if matches!(result, Ok(ref out) if out.success) {
                return Ok(());
            }
            if attempt < poll.attempts {
                tokio::time::sleep(poll.interval).await;
            }
        }
        Err(())
    }

    /// Best effort: a failure here leaves the URL reachable by other
    /// means, so it never fails the workflow.
    async fn register_host(&self, host: &str) {
        let path = &self.settings.hosts_file;
        let current = tokio::fs::read_to_string(path).await.unwrap_or_default();
        if current.lines().any(|line| line.contains(host)) {
            return;
        }
        let updated = format!("{current}127.0.0.1 {host}\n");
        match tokio::fs::write(path, updated).await {
            Ok(()) => info!(host, "hosts entry registered"),
            Err(e) => warn!(host, error = %e, "hosts entry registration failed"),
        }
    }

    /// Idempotent teardown: a release or namespace that is already gone
    /// counts as removed.
    pub async fn uninstall(&self, id: &StoreId) -> HelmResult<()> {
        self.remove_release(&release_name(id)).await
    }

    async fn remove_release(&self, release: &str) -> HelmResult<()> {
        let uninstall = self
            .runner
            .run(
                "helm",
                &[
                    "uninstall".to_string(),
                    release.to_string(),
                    "-n".to_string(),
                    release.to_string(),
                ],
            )
            .await?;
        if !uninstall.success && !uninstall.stderr.contains("not found") {
            return Err(HelmError::Uninstall(uninstall.stderr));
        }

        let delete_ns = self
            .runner
            .run(
                "kubectl",
                &[
                    "delete".to_string(),
                    "namespace".to_string(),
                    release.to_string(),
                    "--ignore-not-found".to_string(),
                ],
            )
            .await?;
        if !delete_ns.success {
            return Err(HelmError::Uninstall(delete_ns.stderr));
        }
        info!(release, "release and namespace removed");
        Ok(())
    }

    /// Current state of one release, `None` when it does not exist.
    pub async fn release_status(&self, id: &StoreId) -> HelmResult<Option<ReleaseState>> {
        let release = release_name(id);
        let output = self
            .runner
            .run(
                "helm",
                &[
                    "status".to_string(),
                    release.clone(),
                    "-n".to_string(),
                    release,
                    "-o".to_string(),
                    "json".to_string(),
                ],
            )
            .await?;
        if !output.success {
            return Ok(None);
        }

        #[derive(serde::Deserialize)]
        struct StatusDoc {
            info: StatusInfo,
        }
        #[derive(serde::Deserialize)]
        struct StatusInfo {
            status: String,
        }

        let doc: StatusDoc = serde_json::from_str(&output.stdout)
            .map_err(|e| HelmError::Install(format!("unparseable helm status output: {e}")))?;
        Ok(Some(ReleaseState::from_helm(&doc.info.status)))
    }

    /// All managed releases across namespaces.
    pub async fn list_releases(&self) -> HelmResult<Vec<ReleaseInfo>> {
        let output = self
            .runner
            .run(
                "helm",
                &[
                    "list".to_string(),
                    "-A".to_string(),
                    "-o".to_string(),
                    "json".to_string(),
                ],
            )
            .await?;
        if !output.success {
            return Err(HelmError::Install(output.stderr));
        }
        parse_release_list(&output.stdout)
            .map_err(|e| HelmError::Install(format!("unparseable helm list output: {e}")))
    }
}
