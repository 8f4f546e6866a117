//! Node registry.
//!
//! The persistent map of managed nodes. Nodes appear on first heartbeat (JIT
//! registration) or explicit provisioning; only heartbeat ingest and the
//! drift detector mutate them. Deleting a node never cascades — historical
//! jobs, backups, and events keep their `node_id` even once it dangles.

use chrono::{DateTime, Utc};
use slm_persist::SnapshotStore;
use slm_proto::{CodeStatus, HeartbeatRequest, Node};
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub code_status: Option<CodeStatus>,
}

pub struct NodeRegistry {
    nodes: HashMap<String, Node>,
    store: SnapshotStore,
}

impl NodeRegistry {
    pub fn new(state_dir: &std::path::Path) -> Self {
        let store = SnapshotStore::new(state_dir, "nodes");
        let nodes = store.load();
        info!(count = nodes.len(), "node registry loaded");
        Self { nodes, store }
    }

    /// Apply a heartbeat. Returns the updated node and whether it was newly
    /// created by this call.
    pub fn upsert_heartbeat(
        &mut self,
        node_id: &str,
        req: &HeartbeatRequest,
        now: DateTime<Utc>,
    ) -> (Node, bool) {
        let created = !self.nodes.contains_key(node_id);
        let node = self
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| Node::new(node_id));

        node.last_seen = Some(now);
        if req.cpu_percent.is_some() {
            node.cpu_percent = req.cpu_percent;
        }
        if req.memory_percent.is_some() {
            node.memory_percent = req.memory_percent;
        }
        if req.disk_percent.is_some() {
            node.disk_percent = req.disk_percent;
        }
        if req.agent_version.is_some() {
            node.agent_version = req.agent_version.clone();
        }
        if req.os_info.is_some() {
            node.os_info = req.os_info.clone();
        }
        if req.code_version.is_some() {
            node.code_version = req.code_version.clone();
        }
        if let Some(hostname) = &req.extra_data.hostname {
            node.hostname = Some(hostname.clone());
        }
        node.extra_data = serde_json::to_value(&req.extra_data).unwrap_or(serde_json::Value::Null);

        let node = node.clone();
        self.snapshot();
        (node, created)
    }

    pub fn get(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn list(&self, filter: &NodeFilter) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .values()
            .filter(|n| filter.code_status.is_none_or(|s| n.code_status == s))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Set a node's drift status. Returns `(old, new)` when the node exists.
    pub fn set_code_status(
        &mut self,
        node_id: &str,
        status: CodeStatus,
    ) -> Option<(CodeStatus, CodeStatus)> {
        let node = self.nodes.get_mut(node_id)?;
        let old = node.code_status;
        node.code_status = status;
        if old != status {
            self.snapshot();
        }
        Some((old, status))
    }

    /// Record provisioning details for remote execution.
    pub fn upsert(&mut self, node: Node) {
        self.nodes.insert(node.node_id.clone(), node);
        self.snapshot();
    }

    pub fn delete(&mut self, node_id: &str) -> bool {
        let removed = self.nodes.remove(node_id).is_some();
        if removed {
            self.snapshot();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.nodes) {
            warn!(error = %e, "failed to snapshot node registry");
        }
    }
}
