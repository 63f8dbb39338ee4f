pub type HelmResult<T> = Result<T, HelmError>;

#[derive(Debug, thiserror::Error)]
pub enum HelmError {
    #[error("release '{0}' already exists")]
    AlreadyExists(String),

    #[error("chart directory not found: {0}")]
    ChartNotFound(String),

    #[error("deployment timed out waiting for release '{0}'")]
    ProvisionTimeout(String),

    #[error("isolation policy '{file}' failed: {detail}")]
    IsolationPolicy { file: String, detail: String },

    #[error("helm install failed: {0}")]
    Install(String),

    #[error("helm uninstall failed: {0}")]
    Uninstall(String),

    #[error("command '{program}' failed to run: {detail}")]
    Command { program: String, detail: String },

    #[error("could not derive store url: {0}")]
    UrlDerivation(String),

    /// Wraps the original failure after compensating cleanup ran.
    #[error("provisioning failed and was rolled back: {0}")]
    ProvisioningFailed(#[source] Box<HelmError>),
}

impl HelmError {
    /// Peel the rollback wrapper to get at what actually went wrong.
    pub fn root(&self) -> &HelmError {
        match self {
            HelmError::ProvisioningFailed(inner) => inner.root(),
            other => other,
        }
    }
}
