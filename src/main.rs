use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::http::{AppState, HttpServer};
use floodgate::probe::{ProbeOrchestrator, ProbePolicy};

#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about = "Adaptive admission control and rate limit discovery")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API server
    Serve {
        /// Listen address, overriding the configuration file
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Probe a target URL until its rate limit pushes back
    Probe {
        /// Target URL
        target: String,

        /// HTTP method to probe with
        #[arg(long, default_value = "GET")]
        method: String,

        /// Known limit of the target; the probe stops shortly past it
        #[arg(long)]
        limit_hint: Option<u32>,

        /// Hard ceiling on issued requests, overriding the configuration file
        #[arg(long)]
        max_requests: Option<u32>,

        /// Delay between requests in milliseconds, overriding the configuration file
        #[arg(long)]
        delay_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => FloodgateConfig::from_file(path)?,
        None => FloodgateConfig::default(),
    };

    match cli.command {
        Command::Serve { listen } => serve(config, listen).await,
        Command::Probe {
            target,
            method,
            limit_hint,
            max_requests,
            delay_ms,
        } => probe(config, target, method, limit_hint, max_requests, delay_ms).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(mut config: FloodgateConfig, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    if let Some(addr) = listen {
        config.server.listen_addr = addr;
    }
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let state = Arc::new(AppState::new(config.clone())?);

    let sweep_interval = config.limits.sweep_interval();
    let sweepers = [
        Arc::clone(&state.clients).spawn_sweeper(sweep_interval),
        Arc::clone(&state.urls).spawn_sweeper(sweep_interval),
        Arc::clone(&state.custom).spawn_sweeper(sweep_interval),
    ];

    let server = HttpServer::bind(config.server.listen_addr, Arc::clone(&state)).await?;
    info!("Starting HTTP server on {}", server.local_addr()?);

    server.serve_with_shutdown(shutdown_signal()).await?;

    for sweeper in sweepers {
        sweeper.cancel();
    }
    info!("Floodgate stopped");
    Ok(())
}

async fn probe(
    config: FloodgateConfig,
    target: String,
    method: String,
    limit_hint: Option<u32>,
    max_requests: Option<u32>,
    delay_ms: Option<u64>,
) -> anyhow::Result<()> {
    let method: http::Method = method.to_uppercase().parse()?;

    let mut probe_config = config.probe;
    if let Some(max) = max_requests {
        probe_config.max_requests = max;
    }
    if let Some(delay) = delay_ms {
        probe_config.request_delay_ms = delay;
    }

    let mut policy = ProbePolicy::from_config(&probe_config);
    if let Some(hint) = limit_hint {
        policy = policy.with_limit_hint(hint);
    }

    let client = reqwest::Client::builder()
        .timeout(probe_config.timeout())
        .user_agent(concat!("floodgate-probe/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling probe");
            interrupt.cancel();
        }
    });

    let report = ProbeOrchestrator::new(client, policy)
        .run(&target, method, &cancel)
        .await;

    info!(
        outcome = ?report.outcome,
        total = report.total_requests,
        successful = report.successful_requests,
        "Probe finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
