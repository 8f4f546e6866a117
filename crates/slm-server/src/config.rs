//! Controller configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the API
    pub bind: SocketAddr,

    /// Directory for persisted controller state (nodes, jobs, backups, events)
    pub state_dir: PathBuf,

    /// Directory for backup artefacts
    pub backup_dir: PathBuf,

    /// Bearer token required on every route except /api/health. `None`
    /// disables auth (development only).
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Root trace sampling rate (parent decisions always inherited)
    #[serde(default = "default_sample_rate")]
    pub trace_sample_rate: f64,

    /// Default SSH user for nodes that have not reported one
    #[serde(default = "default_ssh_user")]
    pub default_ssh_user: String,
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_ssh_user() -> String {
    "slm".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        let state_dir = PathBuf::from("/var/lib/slm");
        Self {
            bind: "127.0.0.1:8080".parse().expect("valid default bind"),
            backup_dir: state_dir.join("backups"),
            state_dir,
            auth_token: None,
            trace_sample_rate: 1.0,
            default_ssh_user: default_ssh_user(),
        }
    }
}
