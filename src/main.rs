mod api;
mod cache;
mod config;
mod error;
mod metrics;
mod models;
mod ringbuf;
mod sandbox;
mod service;
mod singleflight;
mod store;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::metrics::MetricsRegistry;
use crate::sandbox::backend::{ContainerBackend, DockerBackend};
use crate::sandbox::language::LanguageRegistry;
use crate::sandbox::pool::{ContainerPool, PoolConfig};
use crate::sandbox::runner::DockerRunner;
use crate::sandbox::CodeRunner;
use crate::service::TaskService;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to build config")?;
    init_tracing(&config);

    let metrics = Arc::new(MetricsRegistry::new());
    let registry = Arc::new(LanguageRegistry::builtin());
    let backend: Arc<dyn ContainerBackend> = Arc::new(DockerBackend::connect()?);

    let pool = Arc::new(ContainerPool::new(
        PoolConfig {
            max_per_lang: config.container_max_num,
            reserved_per_lang: config.container_reserved_num,
            idle_timeout: config.container_idle_timeout,
        },
        backend.clone(),
        registry.clone(),
        metrics.clone(),
    )?);
    pool.init_reserves()
        .await
        .context("failed to prewarm container reserves")?;
    let eviction = pool.spawn_eviction();

    let runner: Arc<dyn CodeRunner> =
        Arc::new(DockerRunner::new(pool.clone(), registry, backend));
    let store = Arc::new(Store::new(config.journal_path()));
    let service = TaskService::new(
        config.task_pool_num,
        config.user_max_task,
        store,
        runner,
        metrics.clone(),
    );

    let app = api::routes(config.api_keys.clone(), service, metrics);
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind listener")?;
    info!(addr = %config.bind_addr, "sandbox service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    eviction.abort();
    pool.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    warn!("received shutdown signal, draining");
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
