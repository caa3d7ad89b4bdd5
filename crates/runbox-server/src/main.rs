//! Host server for registered algorithms
//!
//! Loads the configuration and the algorithm catalog, boots the sandbox pool
//! when enabled, and serves invocations until SIGINT or SIGTERM. On shutdown
//! every idle or booting sandbox container is stopped and removed.

mod server;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use runbox_core::{
    ConfigLoader, ConverterRegistry, DockerRuntime, FileCatalog, Invoker, RunboxConfig, Sandbox,
};
use server::{build_router, clean_incoming, shutdown_signal, AppState};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Runbox Server - invoke registered algorithms over HTTP")]
struct Cli {
    #[clap(long, short, default_value = "runbox.yaml", help = "Path to the YAML configuration file")]
    config: String,

    #[clap(long, help = "Overrides server.bind_addr from the configuration")]
    bind_addr: Option<String>,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let config = load_config(&cli.config).await?;
    let bind_addr = cli.bind_addr.unwrap_or_else(|| config.server.bind_addr.clone());
    run_server(config, bind_addr).await
}

async fn load_config(path: &str) -> Result<RunboxConfig> {
    if Path::new(path).exists() {
        log::info!("Loading configuration from file: {}", path);
        Ok(ConfigLoader::from_file(path).await?)
    } else {
        log::warn!("Configuration file {} not found, using defaults", path);
        Ok(RunboxConfig::default())
    }
}

async fn run_server(config: RunboxConfig, bind_addr: String) -> Result<()> {
    let converters = Arc::new(
        ConverterRegistry::from_names(&config.converters).context("Invalid converter list")?,
    );
    let catalog = FileCatalog::load(&config.storage.catalog, &config.storage.uploads_dir).await?;

    let incoming_dir = config.storage.uploads_dir.join(".incoming");
    clean_incoming(&incoming_dir)
        .await
        .with_context(|| format!("Failed to clean {}", incoming_dir.display()))?;

    let sandbox = if config.sandbox.enabled {
        let runtime = DockerRuntime::new(config.sandbox.container_options())
            .context("Failed to connect to the Docker daemon")?;
        let sandbox = Sandbox::new(Arc::new(runtime), config.sandbox.pool_size)?;
        sandbox.initialize();
        Some(sandbox)
    } else {
        log::info!("Sandbox disabled: secure invocations will be rejected");
        None
    };

    let state = AppState {
        catalog: Arc::new(catalog),
        invoker: Invoker::new(converters, sandbox.clone(), config.storage.temp_dir.clone()),
        sandbox: sandbox.clone(),
        incoming_dir,
        default_timeout: config.invocation.default_timeout(),
    };

    let bind_socket_addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", bind_addr, e))?;
    let listener = TcpListener::bind(bind_socket_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_socket_addr))?;

    log::info!("Starting runbox server on {}...", bind_socket_addr);
    log::info!("Health check: http://{}/health", bind_socket_addr);

    let served = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(sandbox) = sandbox {
        sandbox.shutdown().await;
    }

    if let Err(e) = served {
        log::error!("Server failed: {}", e);
        return Err(e.into());
    }
    log::info!("Runbox server shut down gracefully.");
    Ok(())
}
