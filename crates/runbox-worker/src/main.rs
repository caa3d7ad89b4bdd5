//! In-container worker
//!
//! Serves a single `POST /` job endpoint and announces its own address to
//! the host once it is listening. The host sends exactly one job per worker
//! and removes the container afterwards.

mod job;

use anyhow::{anyhow, Context, Result};
use axum::routing::post;
use axum::Router;
use clap::Parser;
use job::{job_handler, WorkerState};
use log::LevelFilter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

const HOSTS_FILE: &str = "/etc/hosts";
const ANNOUNCE_ATTEMPTS: u32 = 10;
const ANNOUNCE_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[clap(author, version, about = "Runbox Worker - runs one algorithm job inside a container")]
struct Cli {
    #[clap(long, env = "RUNBOX_WORKER_HOST", default_value = "0.0.0.0")]
    host: String,

    #[clap(long, short, env = "RUNBOX_WORKER_PORT", default_value_t = 3000)]
    port: u16,

    #[clap(long, env = "RUNBOX_WORKER_ROOT", default_value = "/usr/src/app")]
    root: PathBuf,

    #[clap(long, env = "RUNBOX_REGISTER_URL", help = "Host endpoint receiving the readiness announcement")]
    register_url: Option<String>,

    #[clap(long, env = "RUNBOX_WORKER_ADDRESS", help = "Address to announce instead of the one found in /etc/hosts")]
    address: Option<String>,

    #[clap(long, default_value_t = 600_000, help = "Upper bound for a job's runtime in milliseconds")]
    max_runtime_ms: u64,

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

    tokio::fs::create_dir_all(&cli.root)
        .await
        .with_context(|| format!("Failed to create worker root {}", cli.root.display()))?;

    let state = Arc::new(WorkerState {
        root: cli.root.clone(),
        max_runtime: Duration::from_millis(cli.max_runtime_ms),
    });
    let app = Router::new()
        .route("/", post(job_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let bind_addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .map_err(|e| anyhow!("Invalid bind address {}:{}: {}", cli.host, cli.port, e))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    log::info!("Worker listening on {}", bind_addr);

    match cli.register_url.clone() {
        Some(url) => {
            let address = match cli.address.clone() {
                Some(address) => address,
                None => discover_address(cli.port).await?,
            };
            tokio::spawn(async move {
                if let Err(e) = announce(&url, &address).await {
                    log::error!("Readiness announcement failed: {:#}", e);
                }
            });
        }
        None => log::warn!("No register URL configured, the host will not learn about this worker"),
    }

    axum::serve(listener, app).await?;
    Ok(())
}

async fn discover_address(port: u16) -> Result<String> {
    let hosts = tokio::fs::read_to_string(HOSTS_FILE)
        .await
        .with_context(|| format!("Failed to read {}", HOSTS_FILE))?;
    let ip = own_ip_from_hosts(&hosts)
        .ok_or_else(|| anyhow!("No address entry found in {}", HOSTS_FILE))?;
    Ok(format!("{}:{}", ip, port))
}

/// Docker appends the container's own address as the last entry of its
/// hosts file.
fn own_ip_from_hosts(hosts: &str) -> Option<&str> {
    hosts
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_whitespace().next())
        .last()
}

async fn announce(url: &str, address: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let body = serde_json::json!({ "address": address });

    let mut last_error = None;
    for attempt in 1..=ANNOUNCE_ATTEMPTS {
        match client.post(url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                log::info!("Announced {} to {}", address, url);
                return Ok(());
            }
            Ok(response) => {
                last_error = Some(anyhow!("host answered {}", response.status()));
            }
            Err(e) => last_error = Some(e.into()),
        }
        log::debug!("Announcement attempt {} failed, retrying", attempt);
        tokio::time::sleep(ANNOUNCE_BACKOFF * attempt).await;
    }
    Err(last_error.unwrap_or_else(|| anyhow!("no announcement attempt was made")))
}
