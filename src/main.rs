use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;

use podbridge_lib::config::ConfigStorage;
use podbridge_lib::docker::{connect_local_fallback, DockerConnector};
use podbridge_lib::pool::ConnectionPool;
use podbridge_lib::server::{serve, AppState};

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (WebSocket frames)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "podbridge", version, about = "Container and pod shells over WebSocket")]
struct Args {
    /// Config file (default: ~/.podbridge/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `server.listen`
    #[arg(long)]
    listen: Option<String>,

    /// Write the default config file if none exists, then exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    podbridge_lib::init_logging();
    let args = Args::parse();

    let storage = match args.config {
        Some(path) => ConfigStorage::with_path(path),
        None => ConfigStorage::new().context("failed to locate config directory")?,
    };

    if args.init_config {
        if storage.exists().await {
            tracing::info!("Config already exists at {:?}", storage.path());
        } else {
            storage
                .save(&Default::default())
                .await
                .with_context(|| format!("failed to write {:?}", storage.path()))?;
            tracing::info!("Wrote default config to {:?}", storage.path());
        }
        return Ok(());
    }

    let config = storage
        .load()
        .await
        .with_context(|| format!("failed to load {:?}", storage.path()))?;

    tracing::info!("Starting podbridge...");

    let docker_hosts = Arc::new(config.docker_registry());
    let clusters = Arc::new(config.cluster_registry());

    let mut pool =
        ConnectionPool::with_config(DockerConnector::new(), docker_hosts.clone(), config.pool.clone());
    if config.pool.local_fallback {
        let ping_timeout = Duration::from_secs(config.pool.local_ping_timeout_secs);
        if let Some(local) = connect_local_fallback(ping_timeout).await {
            pool = pool.with_fallback(local);
        }
    }
    let pool = Arc::new(pool);
    let reaper = pool.spawn_reaper();

    let state = AppState::new(pool.clone(), docker_hosts, clusters)
        .with_session_config(config.session.clone())
        .with_pod_exec_config(config.pod_exec.clone());

    let listen = args.listen.unwrap_or(config.server.listen);
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve(listener, Arc::new(state), shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutting down...");

    let _ = shutdown_tx.send(true);
    server.await??;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    pool.close();
    tracing::info!("Connection pool closed");

    Ok(())
}
