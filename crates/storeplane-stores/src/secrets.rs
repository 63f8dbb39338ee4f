//! Secret resolution with environment fallback.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};

/// Key-value secret lookup. `None` means the path is not available
/// from this provider; how secrets are actually stored is someone
/// else's concern.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn read(&self, path: &str) -> Option<String>;
}

/// Decorator that falls back to mapped environment variables when the
/// inner provider has nothing for a known path.
pub struct EnvFallback<P> {
    inner: P,
    mappings: HashMap<String, String>,
}

impl<P: SecretProvider> EnvFallback<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            mappings: HashMap::new(),
        }
    }

    pub fn map(mut self, path: &str, env_var: &str) -> Self {
        self.mappings.insert(path.to_string(), env_var.to_string());
        self
    }
}

#[async_trait]
impl<P: SecretProvider> SecretProvider for EnvFallback<P> {
    async fn read(&self, path: &str) -> Option<String> {
        if let Some(value) = self.inner.read(path).await {
            return Some(value);
        }
        let env_var = self.mappings.get(path)?;
        match std::env::var(env_var) {
            Ok(value) => {
                debug!(path, env_var, "secret resolved from environment");
                Some(value)
            }
            Err(_) => {
                warn!(path, env_var, "secret unavailable from provider and environment");
                None
            }
        }
    }
}

/// Provider with no backing source; everything resolves through the
/// fallback mappings.
pub struct NoBackingStore;

#[async_trait]
impl SecretProvider for NoBackingStore {
    async fn read(&self, _path: &str) -> Option<String> {
        None
    }
}

/// Path the daemon reads at startup to reach its own database.
pub const DATABASE_PRIMARY_PATH: &str = "kv/data/database/primary";

/// Default provider chain used by the daemon.
pub fn default_provider() -> EnvFallback<NoBackingStore> {
    EnvFallback::new(NoBackingStore).map(DATABASE_PRIMARY_PATH, "DATABASE_URL")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl SecretProvider for Fixed {
        async fn read(&self, path: &str) -> Option<String> {
            (path == "known").then(|| self.0.to_string())
        }
    }

    #[tokio::test]
    async fn inner_provider_wins() {
        let provider = EnvFallback::new(Fixed("from-inner")).map("known", "STOREPLANE_TEST_UNSET");
        assert_eq!(provider.read("known").await.as_deref(), Some("from-inner"));
    }

    #[tokio::test]
    async fn unmapped_path_misses() {
        let provider = EnvFallback::new(NoBackingStore);
        assert_eq!(provider.read("kv/data/unknown").await, None);
    }

    #[tokio::test]
    async fn falls_back_to_mapped_env_var() {
        // Var name unique to this test to avoid cross-test interference.
        unsafe { std::env::set_var("STOREPLANE_SECRET_FALLBACK_TEST", "postgres://env") };
        let provider =
            EnvFallback::new(NoBackingStore).map("db/url", "STOREPLANE_SECRET_FALLBACK_TEST");
        assert_eq!(
            provider.read("db/url").await.as_deref(),
            Some("postgres://env")
        );
    }
}
