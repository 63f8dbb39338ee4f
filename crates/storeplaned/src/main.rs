//! storeplaned — the storeplane daemon.
//!
//! Single binary that assembles the control plane:
//! - Primary/replica connection manager with failover
//! - Circuit breaker registry (store reads, store writes, security)
//! - Helm orchestrator + store lifecycle service
//! - REST API
//!
//! # Usage
//!
//! ```text
//! storeplaned serve --port 8080 --domain shops.example.com
//! ```

mod observe;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use storeplane_api::{AllowAllSecurity, ApiState, SECURITY, STORE_READ, STORE_WRITE};
use storeplane_breaker::{BreakerConfig, FallbackPolicy, Registry};
use storeplane_core::{DaemonSettings, Environment};
use storeplane_db::{ConnectionManager, DatabaseSettings, ManagerOptions, PoolSettings};
use storeplane_helm::{HelmOrchestrator, OrchestratorSettings, ShellRunner};
use storeplane_stores::{
    default_provider, ensure_schema, AllowAll, DbAuditSink, SecretProvider, SqlStoreRepository,
    StoreService, DATABASE_PRIMARY_PATH,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "storeplaned", about = "storeplane control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server and provisioning workers.
    Serve {
        /// Settings file (TOML). Env vars and flags override it.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Primary database url (overrides settings and secrets).
        #[arg(long)]
        database_url: Option<String>,

        /// Directory holding the engine Helm charts.
        #[arg(long)]
        chart_path: Option<PathBuf>,

        /// Directory holding the isolation policy templates.
        #[arg(long)]
        policy_dir: Option<PathBuf>,

        /// Base domain for store URLs.
        #[arg(long)]
        domain: Option<String>,

        /// Deployment environment: local or production.
        #[arg(long)]
        environment: Option<String>,

        /// Primary pool health-check interval, seconds.
        #[arg(long)]
        primary_health_interval: Option<u64>,

        /// Replica pool health-check interval, seconds.
        #[arg(long)]
        replica_health_interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,storeplaned=debug,storeplane=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            database_url,
            chart_path,
            policy_dir,
            domain,
            environment,
            primary_health_interval,
            replica_health_interval,
        } => {
            let mut settings = match config {
                Some(path) => DaemonSettings::from_file(&path)?,
                None => DaemonSettings::default(),
            }
            .apply_env_overrides();

            if let Some(port) = port {
                settings.port = port;
            }
            if let Some(url) = database_url {
                settings.database.url = Some(url);
            }
            if let Some(path) = chart_path {
                settings.chart_path = path;
            }
            if let Some(dir) = policy_dir {
                settings.policy_dir = dir;
            }
            if let Some(domain) = domain {
                settings.domain = domain;
            }
            if let Some(env) = environment {
                settings.environment = env
                    .parse::<Environment>()
                    .map_err(anyhow::Error::msg)?;
            }
            if let Some(secs) = primary_health_interval {
                settings.primary_health_interval_secs = secs;
            }
            if let Some(secs) = replica_health_interval {
                settings.replica_health_interval_secs = secs;
            }

            run_serve(settings).await
        }
    }
}

async fn run_serve(settings: DaemonSettings) -> anyhow::Result<()> {
    info!("storeplane daemon starting");

    // ── Database ───────────────────────────────────────────────

    let primary_url = match settings.database.url.clone() {
        Some(url) => url,
        None => default_provider()
            .read(DATABASE_PRIMARY_PATH)
            .await
            .ok_or_else(|| anyhow::anyhow!("no database url configured"))?,
    };

    let tls = !settings.environment.is_local();
    let mut primary = PoolSettings::new(primary_url).with_tls(tls);
    if let Some(max) = settings.database.max_connections {
        primary = primary.with_max_connections(max);
    }
    let replicas = settings
        .database
        .replica_urls
        .iter()
        .map(|url| PoolSettings::new(url).with_tls(tls))
        .collect();
    let db_settings = DatabaseSettings::new(primary).with_replicas(replicas);

    let manager_options = ManagerOptions {
        primary_health_interval: Duration::from_secs(settings.primary_health_interval_secs),
        replica_health_interval: Duration::from_secs(settings.replica_health_interval_secs),
        ..ManagerOptions::default()
    };
    let (db, db_events) = ConnectionManager::connect(&db_settings, manager_options).await?;
    db.spawn_health_tasks();
    ensure_schema(&db).await?;
    info!(replicas = settings.database.replica_urls.len(), "database layer ready");

    // ── Circuit breakers ───────────────────────────────────────

    let (breakers, breaker_events) = Registry::new(64);
    breakers.register(
        STORE_READ,
        BreakerConfig::default(),
        FallbackPolicy::CacheServe { max_snapshots: 1024 },
    );
    breakers.register(
        STORE_WRITE,
        BreakerConfig::default(),
        FallbackPolicy::QueueDefer { capacity: 256 },
    );
    breakers.register(SECURITY, BreakerConfig::strict(), FallbackPolicy::FailClosed);
    info!("circuit breakers registered");

    // ── Orchestrator + store service ───────────────────────────

    let orchestrator = Arc::new(HelmOrchestrator::new(
        Arc::new(ShellRunner),
        OrchestratorSettings::new(
            settings.chart_path.clone(),
            settings.policy_dir.clone(),
            settings.domain.clone(),
            settings.environment,
        ),
    ));

    let service = Arc::new(StoreService::new(
        Arc::new(SqlStoreRepository::new(db.clone())),
        orchestrator,
        Arc::new(DbAuditSink::new(db.clone())),
        Arc::new(AllowAll),
    ));
    info!("store service initialized");

    // ── Observability task ─────────────────────────────────────

    let observer = tokio::spawn(observe::run(db_events, breaker_events));

    // ── API server ─────────────────────────────────────────────

    let ready = Arc::new(AtomicBool::new(false));
    let state = ApiState {
        service: service.clone(),
        breakers,
        security: Arc::new(AllowAllSecurity),
        ready: ready.clone(),
    };
    let router = storeplane_api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    ready.store(true, Ordering::Release);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
        })
        .await?;

    // ── Teardown ───────────────────────────────────────────────

    service.abort_workflows();
    db.close().await;
    observer.abort();

    info!("storeplane daemon stopped");
    Ok(())
}
