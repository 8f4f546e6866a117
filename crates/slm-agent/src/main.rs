//! slm-agent — SLM node agent daemon
//!
//! Heartbeats node health to the controller, buffers events while it is
//! unreachable, and exposes the code-change notify API on code-source nodes.

use clap::Parser;
use slm_agent::{AgentConfig, SlmAgent};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "slm-agent")]
#[command(about = "SLM node agent")]
#[command(version)]
struct Cli {
    /// Controller base URL
    #[arg(long, env = "SLM_ADMIN_URL", default_value = "https://127.0.0.1")]
    admin_url: String,

    /// Stable node identifier (required)
    #[arg(long, env = "SLM_NODE_ID")]
    node_id: Option<String>,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = 30)]
    interval: u64,

    /// Systemd services to monitor
    #[arg(long, num_args = 0..)]
    services: Vec<String>,

    /// Path to the event buffer database
    #[arg(long, env = "SLM_BUFFER_DB", default_value = "/var/lib/slm-agent/events.db")]
    buffer_db: PathBuf,

    /// Enable code-source mode (starts the notify server for git hooks)
    #[arg(long, env = "SLM_CODE_SOURCE", default_value_t = false)]
    code_source: bool,

    /// Port for the notify server (code-source mode)
    #[arg(long, env = "SLM_NOTIFY_PORT", default_value_t = 8000)]
    notify_port: u16,

    /// Accept invalid TLS certificates (pre-PKI fleets only)
    #[arg(long)]
    insecure: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn init_logging(debug: bool) -> anyhow::Result<()> {
    let level = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive(format!("slm_agent={level}").parse()?)
                .add_directive(format!("slm_transport={level}").parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.debug) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(2);
    }

    let Some(node_id) = cli.node_id else {
        error!("node id required (--node-id or SLM_NODE_ID)");
        std::process::exit(1);
    };

    let config = AgentConfig {
        admin_url: cli.admin_url,
        node_id,
        heartbeat_interval_secs: cli.interval,
        services: cli.services,
        buffer_db: cli.buffer_db,
        code_source: cli.code_source,
        notify_port: cli.notify_port,
        insecure: cli.insecure,
    };

    let agent = match SlmAgent::new(config) {
        Ok(agent) => Arc::new(agent),
        Err(e) => {
            error!(error = %e, "fatal startup error");
            std::process::exit(2);
        }
    };

    spawn_signal_handler(Arc::clone(&agent));

    if let Err(e) = agent.run().await {
        error!(error = %e, "agent exited with error");
        std::process::exit(2);
    }
}

fn spawn_signal_handler(agent: Arc<SlmAgent>) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        agent.stop();
    });
}
