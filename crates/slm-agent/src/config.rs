//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the SLM node agent. Built from CLI flags with `SLM_*`
/// environment fallbacks; there is no config file on the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Controller base URL (e.g. https://admin.fleet.internal)
    pub admin_url: String,

    /// Stable node identifier. Required.
    pub node_id: String,

    /// Heartbeat interval in seconds
    #[serde(default = "default_interval")]
    pub heartbeat_interval_secs: u64,

    /// Systemd services to report status for
    #[serde(default)]
    pub services: Vec<String>,

    /// Path to the SQLite event buffer
    #[serde(default = "default_buffer_db")]
    pub buffer_db: PathBuf,

    /// Whether this node is the canonical code source (runs the notify server)
    #[serde(default)]
    pub code_source: bool,

    /// Localhost port for the notify server
    #[serde(default = "default_notify_port")]
    pub notify_port: u16,

    /// Accept invalid TLS certificates (pre-PKI fleets only)
    #[serde(default)]
    pub insecure: bool,
}

fn default_interval() -> u64 {
    30
}

fn default_buffer_db() -> PathBuf {
    PathBuf::from("/var/lib/slm-agent/events.db")
}

fn default_notify_port() -> u16 {
    8000
}

impl AgentConfig {
    /// Controller URL with any trailing slash trimmed.
    pub fn admin_base(&self) -> &str {
        self.admin_url.trim_end_matches('/')
    }

    /// Directory holding agent state (`version.json` lives beside the buffer).
    pub fn state_dir(&self) -> PathBuf {
        self.buffer_db
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
