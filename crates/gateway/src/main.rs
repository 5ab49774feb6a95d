use anyhow::Context as _;
use clap::Parser;
use peac_gateway::config::GatewayConfig;
use peac_gateway::server;
use std::net::SocketAddr;

#[derive(Debug, Parser)]
#[command(
    name = "peac-gateway",
    about = "Verification gateway for PEAC receipts and signed requests"
)]
struct Args {
    /// Listen address; overrides LISTEN_ADDR.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON.
    #[arg(long, env = "LOG_JSON")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut cfg = GatewayConfig::from_env().context("load configuration")?;
    if let Some(listen) = args.listen {
        cfg.listen_addr = listen;
    }

    let listen_addr = cfg.listen_addr;
    let mode = cfg.mode;
    let state = server::build_state(cfg).context("build gateway state")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("bind {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, mode = ?mode, "peac gateway listening");

    server::serve(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
    }
    tracing::info!("shutting down");
}

fn init_tracing(json_logs: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
