//! Pool configuration, fixed at process start.

use std::time::Duration;

/// Configuration for a single connection pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub url: String,
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub tls: bool,
}

impl PoolSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 20,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
            tls: false,
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }
}

/// One primary and zero-or-more replicas, in configured order.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub primary: PoolSettings,
    pub replicas: Vec<PoolSettings>,
}

impl DatabaseSettings {
    pub fn new(primary: PoolSettings) -> Self {
        Self {
            primary,
            replicas: Vec::new(),
        }
    }

    pub fn with_replicas(mut self, replicas: Vec<PoolSettings>) -> Self {
        self.replicas = replicas;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_settings_defaults() {
        let settings = PoolSettings::new("postgresql://localhost/stores");
        assert_eq!(settings.max_connections, 20);
        assert_eq!(settings.idle_timeout, Duration::from_secs(30));
        assert_eq!(settings.connect_timeout, Duration::from_secs(2));
        assert!(!settings.tls);
    }

    #[test]
    fn database_settings_builder() {
        let settings = DatabaseSettings::new(PoolSettings::new("postgresql://p/stores"))
            .with_replicas(vec![
                PoolSettings::new("postgresql://r0/stores"),
                PoolSettings::new("postgresql://r1/stores"),
            ]);
        assert_eq!(settings.replicas.len(), 2);
    }
}
