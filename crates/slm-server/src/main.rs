//! slm-server — SLM controller daemon
//!
//! Serves the fleet API: heartbeat ingest, update planning and jobs, backup
//! execution, and the WebSocket event stream.

use clap::Parser;
use slm_exec::SshRunnerFactory;
use slm_server::{router, AppState, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "slm-server")]
#[command(about = "SLM fleet controller")]
#[command(version)]
struct Cli {
    /// Listen address
    #[arg(long, env = "SLM_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Directory for persisted controller state
    #[arg(long, env = "SLM_STATE_DIR", default_value = "/var/lib/slm")]
    state_dir: PathBuf,

    /// Directory for backup artefacts (defaults to {state_dir}/backups)
    #[arg(long, env = "SLM_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Bearer token required on every route except /api/health
    #[arg(long, env = "SLM_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Root trace sampling rate (0.0–1.0)
    #[arg(long, env = "SLM_TRACE_SAMPLE_RATE", default_value_t = 1.0)]
    trace_sample_rate: f64,

    /// Default SSH user for nodes that have not reported one
    #[arg(long, env = "SLM_SSH_USER", default_value = "slm")]
    ssh_user: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive(format!("slm_server={level}").parse()?)
                .add_directive(format!("slm_bus={level}").parse()?)
                .add_directive(format!("slm_exec={level}").parse()?),
        )
        .init();

    if cli.auth_token.is_none() {
        warn!("no auth token configured; API is open (development mode)");
    }

    let config = ServerConfig {
        bind: cli.bind,
        backup_dir: cli
            .backup_dir
            .unwrap_or_else(|| cli.state_dir.join("backups")),
        state_dir: cli.state_dir,
        auth_token: cli.auth_token,
        trace_sample_rate: cli.trace_sample_rate,
        default_ssh_user: cli.ssh_user,
    };

    info!(
        bind = %config.bind,
        state_dir = %config.state_dir.display(),
        backup_dir = %config.backup_dir.display(),
        "slm-server starting"
    );

    let state = AppState::new(config.clone(), Arc::new(SshRunnerFactory));

    // No job survives a controller restart; fail leftovers explicitly.
    let swept = state.jobs.write().sweep_orphans();
    if swept > 0 {
        warn!(count = swept, "failed jobs orphaned by restart");
    }

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
