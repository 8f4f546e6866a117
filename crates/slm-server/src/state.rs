//! Shared controller state.
//!
//! One process owns everything: the registry, stores, event bus, and the
//! in-memory map of running jobs. If multiple controller instances are ever
//! run, that map must become a shared lease keyed on `job_id` to avoid
//! double execution — single-writer is an assumption, not a guarantee.

use parking_lot::{Mutex, RwLock};
use slm_bus::{topic_job, topic_node, EventBus, TOPIC_GLOBAL};
use slm_exec::{CommandRunner, RunnerFactory};
use slm_proto::{EventSeverity, EventType, Node, NodeEvent, WsFrame};
use slm_transport::Sampler;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::drift::DriftDetector;
use crate::events::EventLog;
use crate::jobs::JobStore;
use crate::registry::NodeRegistry;
use crate::updates::UpdateStore;

const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<RwLock<NodeRegistry>>,
    pub updates: Arc<RwLock<UpdateStore>>,
    pub jobs: Arc<RwLock<JobStore>>,
    pub backups: Arc<RwLock<crate::backups::BackupStore>>,
    pub events: Arc<RwLock<EventLog>>,
    pub drift: Arc<RwLock<DriftDetector>>,
    pub bus: EventBus,
    /// Cooperative cancel flags for in-flight jobs, cleared on terminal
    /// transition.
    pub running_jobs: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    pub runners: Arc<dyn RunnerFactory>,
    pub sampler: Sampler,
}

impl AppState {
    pub fn new(config: ServerConfig, runners: Arc<dyn RunnerFactory>) -> Self {
        std::fs::create_dir_all(&config.state_dir).ok();
        std::fs::create_dir_all(&config.backup_dir).ok();

        let state_dir = config.state_dir.clone();
        let sampler = Sampler::new(config.trace_sample_rate);
        Self {
            registry: Arc::new(RwLock::new(NodeRegistry::new(&state_dir))),
            updates: Arc::new(RwLock::new(UpdateStore::new(&state_dir))),
            jobs: Arc::new(RwLock::new(JobStore::new(&state_dir))),
            backups: Arc::new(RwLock::new(crate::backups::BackupStore::new(&state_dir))),
            events: Arc::new(RwLock::new(EventLog::new(&state_dir))),
            drift: Arc::new(RwLock::new(DriftDetector::new(&state_dir))),
            bus: EventBus::default(),
            running_jobs: Arc::new(Mutex::new(HashMap::new())),
            runners,
            sampler,
            config: Arc::new(config),
        }
    }

    /// Record a node event and fan it out to the global and per-node topics.
    pub fn emit_event(
        &self,
        node_id: &str,
        event_type: EventType,
        severity: EventSeverity,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> NodeEvent {
        let event = self
            .events
            .write()
            .record(node_id, event_type, severity, message, details);

        let frame = WsFrame::new(
            "node_event",
            serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
        );
        self.bus.publish(TOPIC_GLOBAL, frame.clone());
        self.bus.publish(&topic_node(node_id), frame);
        event
    }

    /// Broadcast a job progress frame to the job topic and the global feed.
    pub fn publish_job_progress(
        &self,
        job_id: &str,
        status: &str,
        progress: u8,
        message: Option<&str>,
    ) {
        let frame = WsFrame::new(
            "update_job_progress",
            serde_json::json!({
                "job_id": job_id,
                "status": status,
                "progress": progress,
                "message": message,
            }),
        );
        self.bus.publish(&topic_job(job_id), frame.clone());
        self.bus.publish(TOPIC_GLOBAL, frame);
    }

    /// Resolve the command runner for a node. The endpoint falls back from
    /// reported IP to hostname to the node id itself.
    pub fn runner_for_node(&self, node: &Node) -> Arc<dyn CommandRunner> {
        let host = node
            .ip_address
            .clone()
            .or_else(|| node.hostname.clone())
            .unwrap_or_else(|| node.node_id.clone());
        let user = node
            .ssh_user
            .clone()
            .unwrap_or_else(|| self.config.default_ssh_user.clone());
        let port = node.ssh_port.unwrap_or(DEFAULT_SSH_PORT);
        self.runners.for_endpoint(&host, &user, port)
    }
}
