mod auth;
mod config;
mod dto;
mod error;
mod monitor;
mod routes;
mod state;

use std::sync::Arc;

use nr_db::{MemoryStore, PgStore, Store};
use nr_engine::Services;
use nr_engine::config::EngineConfig;
use nr_engine::deployer::HttpReadiness;
use nr_engine::queue::{JobQueue, spawn_workers};
use nr_infra::dns::CloudflareDns;
use nr_infra::hetzner::HetznerProvider;
use nr_infra::ssh::{SshConfig, SshConnector};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::monitor::spawn_metrics_sync;
use crate::routes::api_router;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    // Store
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pool = nr_db::create_pool(url)
                .await
                .expect("failed to connect to database");
            nr_db::run_migrations(&pool)
                .await
                .expect("failed to run migrations");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store; state is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    // Engine
    let engine_config = EngineConfig::from_env().expect("invalid engine configuration");
    let cloud = HetznerProvider::from_env().expect("failed to build cloud provider");
    let dns = CloudflareDns::from_env().expect("failed to build DNS provider");
    let ssh_config = SshConfig::from_env().expect("invalid SSH configuration");
    let readiness = HttpReadiness::new().expect("failed to build readiness check");
    tracing::info!(
        base_domain = %engine_config.base_domain,
        provisioning = engine_config.provisioning_enabled,
        "engine configured"
    );

    let (queue, rx) = JobQueue::new(engine_config.retry.clone());
    let svc = Services {
        store,
        cloud: Arc::new(cloud),
        dns: Arc::new(dns),
        remote: Arc::new(SshConnector::new(ssh_config)),
        readiness: Arc::new(readiness),
        config: Arc::new(engine_config),
        queue: queue.clone(),
    };

    let workers = spawn_workers(svc.clone(), rx, config.worker_count);
    tracing::info!(workers = workers.len(), "job workers started");
    spawn_metrics_sync(queue, config.metrics_interval_secs);

    let state = AppState {
        svc,
        config: config.clone(),
    };

    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("failed to bind listener");

    tracing::info!(addr = %config.listen_addr, "starting noderack API");

    axum::serve(listener, app).await.expect("server error");
}
