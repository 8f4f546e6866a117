//! Update inventory and fleet planning.
//!
//! [`UpdateStore`] holds the known package updates; rows with no `node_id`
//! are fleet-global. The fleet summary counts each global row once per node
//! for per-node totals, but exactly once in the fleet aggregate.

use slm_persist::SnapshotStore;
use slm_proto::{
    CodeStatus, FleetUpdateSummary, Node, NodeUpdateSummary, UpdateInfo,
};
use std::collections::HashMap;
use tracing::warn;

pub struct UpdateStore {
    rows: HashMap<String, UpdateInfo>,
    store: SnapshotStore,
}

impl UpdateStore {
    pub fn new(state_dir: &std::path::Path) -> Self {
        let store = SnapshotStore::new(state_dir, "updates");
        let rows = store.load();
        Self { rows, store }
    }

    pub fn insert(&mut self, update: UpdateInfo) {
        self.rows.insert(update.update_id.clone(), update);
        self.snapshot();
    }

    pub fn get(&self, update_id: &str) -> Option<&UpdateInfo> {
        self.rows.get(update_id)
    }

    /// Resolve the rows for the requested ids; unknown ids are skipped.
    pub fn get_many(&self, update_ids: &[String]) -> Vec<UpdateInfo> {
        update_ids
            .iter()
            .filter_map(|id| self.rows.get(id))
            .cloned()
            .collect()
    }

    /// Unapplied updates. With a node id: that node's rows plus globals.
    /// Without: globals only (fleet scope). Most severe first, then newest.
    pub fn list_unapplied(&self, node_id: Option<&str>) -> Vec<UpdateInfo> {
        let mut updates: Vec<UpdateInfo> = self
            .rows
            .values()
            .filter(|u| !u.is_applied)
            .filter(|u| match node_id {
                Some(id) => u.applies_to(id),
                None => u.node_id.is_none(),
            })
            .cloned()
            .collect();
        updates.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.created_at.cmp(&a.created_at))
        });
        updates
    }

    /// Whether any unapplied update applies to this node.
    pub fn has_unapplied_for(&self, node_id: &str) -> bool {
        self.rows
            .values()
            .any(|u| !u.is_applied && u.applies_to(node_id))
    }

    pub fn mark_applied(&mut self, update_id: &str) -> bool {
        let Some(update) = self.rows.get_mut(update_id) else {
            return false;
        };
        update.mark_applied(chrono::Utc::now());
        self.snapshot();
        true
    }

    /// Per-node and fleet-wide counts. The per-node system count is that
    /// node's own unapplied rows plus every unapplied global row; the fleet
    /// aggregate counts each global row once so a three-node fleet with one
    /// global update reports one system update, not three.
    pub fn fleet_summary(&self, nodes: &[Node]) -> FleetUpdateSummary {
        let mut by_node: HashMap<&str, usize> = HashMap::new();
        let mut global_count = 0usize;
        for update in self.rows.values().filter(|u| !u.is_applied) {
            match update.node_id.as_deref() {
                Some(id) => *by_node.entry(id).or_default() += 1,
                None => global_count += 1,
            }
        }

        let summaries: Vec<NodeUpdateSummary> = nodes
            .iter()
            .map(|node| {
                let system_updates =
                    by_node.get(node.node_id.as_str()).copied().unwrap_or(0) + global_count;
                let code_outdated = node.code_status == CodeStatus::Outdated;
                NodeUpdateSummary {
                    node_id: node.node_id.clone(),
                    hostname: node.hostname.clone(),
                    system_updates,
                    code_update_available: code_outdated,
                    code_status: node.code_status,
                    total_updates: system_updates + usize::from(code_outdated),
                }
            })
            .collect();

        let node_specific: usize = by_node.values().sum();
        FleetUpdateSummary {
            total_system_updates: node_specific + global_count,
            total_code_updates: summaries.iter().filter(|s| s.code_update_available).count(),
            nodes_needing_updates: summaries.iter().filter(|s| s.total_updates > 0).count(),
            nodes: summaries,
        }
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.rows) {
            warn!(error = %e, "failed to snapshot update inventory");
        }
    }
}
