//! Daemon configuration.
//!
//! Settings load from a TOML file when one is given, then individual
//! environment variables override file values. Every field has a
//! local-development default so `storeplaned serve` works out of the box.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Deployment environment. Controls URL derivation and values overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Local,
    Production,
}

impl Environment {
    pub fn is_local(self) -> bool {
        matches!(self, Environment::Local)
    }

    /// Values overlay file name inside a chart directory.
    pub fn values_file(self) -> &'static str {
        match self {
            Environment::Local => "values-local.yaml",
            Environment::Production => "values-prod.yaml",
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Environment::Local),
            "production" => Ok(Environment::Production),
            other => Err(format!("unknown environment: {other}")),
        }
    }
}

/// Database connection settings as configured (urls resolved later via
/// the secret provider when absent).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseSection {
    pub url: Option<String>,
    #[serde(default)]
    pub replica_urls: Vec<String>,
    pub max_connections: Option<u32>,
}

/// Full daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default = "default_chart_path")]
    pub chart_path: PathBuf,
    #[serde(default = "default_policy_dir")]
    pub policy_dir: PathBuf,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default)]
    pub environment: Environment,
    /// Primary pool health-check interval, seconds.
    #[serde(default = "default_primary_interval")]
    pub primary_health_interval_secs: u64,
    /// Replica pool health-check interval, seconds.
    #[serde(default = "default_replica_interval")]
    pub replica_health_interval_secs: u64,
}

fn default_port() -> u16 {
    8080
}
fn default_chart_path() -> PathBuf {
    PathBuf::from("./helm")
}
fn default_policy_dir() -> PathBuf {
    PathBuf::from("./kubernetes/isolation")
}
fn default_domain() -> String {
    "local".to_string()
}
fn default_primary_interval() -> u64 {
    30
}
fn default_replica_interval() -> u64 {
    45
}

impl Default for DaemonSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty settings must deserialize from defaults")
    }
}

impl DaemonSettings {
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::Read(path.display().to_string(), e.to_string()))?;
        let settings = toml::from_str(&content)
            .map_err(|e| SettingsError::Parse(path.display().to_string(), e.to_string()))?;
        Ok(settings)
    }

    /// Apply environment-variable overrides on top of the loaded values.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(port) = std::env::var("STOREPLANE_PORT")
            && let Ok(port) = port.parse()
        {
            self.port = port;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Ok(replicas) = std::env::var("DATABASE_REPLICA_URLS") {
            self.database.replica_urls = replicas
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(domain) = std::env::var("STOREPLANE_DOMAIN") {
            self.domain = domain;
        }
        if let Ok(env) = std::env::var("STOREPLANE_ENVIRONMENT")
            && let Ok(env) = env.parse()
        {
            self.environment = env;
        }
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {0}: {1}")]
    Read(String, String),

    #[error("failed to parse settings file {0}: {1}")]
    Parse(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_local() {
        let settings = DaemonSettings::default();
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.environment, Environment::Local);
        assert_eq!(settings.domain, "local");
        assert!(settings.database.url.is_none());
        assert_eq!(settings.primary_health_interval_secs, 30);
        assert_eq!(settings.replica_health_interval_secs, 45);
    }

    #[test]
    fn parse_full_file() {
        let toml_str = r#"
port = 9000
domain = "shops.example.com"
environment = "production"

[database]
url = "postgresql://principal/stores"
replica_urls = ["postgresql://replica-a/stores", "postgresql://replica-b/stores"]
max_connections = 50
"#;
        let settings: DaemonSettings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.environment, Environment::Production);
        assert_eq!(settings.database.replica_urls.len(), 2);
        assert_eq!(settings.database.max_connections, Some(50));
        // Unspecified sections keep their defaults.
        assert_eq!(settings.chart_path, PathBuf::from("./helm"));
    }

    #[test]
    fn values_file_per_environment() {
        assert_eq!(Environment::Local.values_file(), "values-local.yaml");
        assert_eq!(Environment::Production.values_file(), "values-prod.yaml");
    }
}
