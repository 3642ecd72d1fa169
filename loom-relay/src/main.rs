//! cipherloom-relay binary entry point.
//!
//! Usage:
//! ```bash
//! cipherloom-relay --config relay.toml
//! RUST_LOG=cipherloom_relay=debug cipherloom-relay
//! ```

use anyhow::Context;
use cipherloom_relay::cleanup::spawn_cleanup_task;
use cipherloom_relay::http::{build_router, health};
use cipherloom_relay::storage::SqliteStorage;
use cipherloom_relay::{Config, Relay};
use loom_mesh::{IrohSwarm, MeshParticipant};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = get_config_path();
    let mut config = if config_path.exists() {
        Config::from_file(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        tracing::warn!("{} not found, using defaults", config_path.display());
        Config::default()
    };
    let addr = config.bind_addr()?;

    // Storage failure is fatal when persistence is enabled.
    let storage = if config.storage.enabled {
        tracing::info!("Opening database {}", config.storage.database.display());
        SqliteStorage::new(&config.storage.database)
            .await
            .with_context(|| format!("opening {}", config.storage.database.display()))?
    } else {
        tracing::info!("Durable storage disabled, persistence requests will be refused");
        SqliteStorage::in_memory().await?
    };

    let mesh = if config.mesh.enabled {
        config.mesh.persistence = config.storage.enabled;
        let swarm = IrohSwarm::bind(&config.mesh.bootstrap_peers).await?;
        let mesh = MeshParticipant::new(config.mesh.clone(), Arc::new(swarm));
        mesh.start().await?;
        Some(mesh)
    } else {
        None
    };

    health::init_start_time();
    let relay = Arc::new(Relay::new(config, storage, mesh));
    let cleanup = spawn_cleanup_task(
        relay.storage_arc(),
        relay.rate_limits().clone(),
        relay.config().cleanup.clone(),
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("cipherloom-relay v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);

    let app = build_router(relay.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(relay.clone()))
    .await?;

    cleanup.abort();
    Ok(())
}

/// Resolves on Ctrl-C, after closing sessions and flushing state.
async fn shutdown_signal(relay: Arc<Relay>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
    relay.shutdown().await;
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("relay.toml"))
}
