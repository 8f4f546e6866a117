//! Append-only node event log.
//!
//! Events come from two places: controller-side transitions (registration,
//! drift, deployments, backups) and the agents' buffered-event sync. Sync
//! delivery is at-least-once, so ingest is idempotent on the agent's
//! `(node_id, event_id)` pair — replays are acknowledged without a new row.

use chrono::Utc;
use slm_persist::SnapshotStore;
use slm_proto::{short_id, EventSeverity, EventType, NodeEvent, SyncEvent};
use std::collections::HashMap;
use tracing::{debug, warn};

pub struct EventLog {
    rows: HashMap<String, NodeEvent>,
    store: SnapshotStore,
}

impl EventLog {
    pub fn new(state_dir: &std::path::Path) -> Self {
        let store = SnapshotStore::new(state_dir, "node_events");
        let rows = store.load();
        Self { rows, store }
    }

    /// Record a controller-side event.
    pub fn record(
        &mut self,
        node_id: &str,
        event_type: EventType,
        severity: EventSeverity,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> NodeEvent {
        let event = NodeEvent {
            event_id: short_id(),
            node_id: node_id.to_string(),
            event_type,
            severity,
            message: message.into(),
            details,
            created_at: Utc::now(),
        };
        self.rows.insert(event.event_id.clone(), event.clone());
        self.snapshot();
        event
    }

    /// Ingest one buffered agent event. The row id is derived from the
    /// agent's monotonic id, so a replay lands on the same key and is a
    /// no-op. Returns the stored event when this delivery was the first.
    pub fn ingest_synced(&mut self, node_id: &str, event: &SyncEvent) -> Option<NodeEvent> {
        let event_id = format!("sync-{node_id}-{}", event.id);
        if self.rows.contains_key(&event_id) {
            debug!(node_id, agent_event_id = event.id, "duplicate sync event acknowledged");
            return None;
        }

        let Some(event_type) = parse_agent_event_type(&event.event_type) else {
            warn!(node_id, event_type = %event.event_type, "unknown buffered event type, dropping");
            return None;
        };

        let row = NodeEvent {
            event_id,
            node_id: node_id.to_string(),
            event_type,
            severity: EventSeverity::Info,
            message: format!("{} (buffered)", event.event_type),
            details: event.data.clone(),
            created_at: Utc::now(),
        };
        self.rows.insert(row.event_id.clone(), row.clone());
        self.snapshot();
        Some(row)
    }

    /// Events for one node, newest first. Tolerates dangling node ids.
    pub fn for_node(&self, node_id: &str, limit: usize) -> Vec<NodeEvent> {
        let mut events: Vec<NodeEvent> = self
            .rows
            .values()
            .filter(|e| e.node_id == node_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(limit);
        events
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.rows) {
            warn!(error = %e, "failed to snapshot event log");
        }
    }
}

fn parse_agent_event_type(name: &str) -> Option<EventType> {
    match name {
        "heartbeat" => Some(EventType::Heartbeat),
        "code_change" => Some(EventType::CodeChange),
        _ => None,
    }
}
