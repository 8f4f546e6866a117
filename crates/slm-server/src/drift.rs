//! Code-drift detection.
//!
//! The controller holds one canonical [`CodeVersion`]: whatever the
//! designated code-source node last reported. Git-hook notifications replace
//! it unconditionally; heartbeats from the same node replace it when the
//! commit moved. Every other node is classified against it on each heartbeat.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slm_persist::SnapshotStore;
use slm_proto::{CodeStatus, CodeVersion, CodeVersionSource};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DriftState {
    canonical: Option<CodeVersion>,
    source_node_id: Option<String>,
}

pub struct DriftDetector {
    state: DriftState,
    store: SnapshotStore,
}

impl DriftDetector {
    pub fn new(state_dir: &std::path::Path) -> Self {
        let store = SnapshotStore::new(state_dir, "code_version");
        let mut rows: HashMap<String, DriftState> = store.load();
        let state = rows.remove("state").unwrap_or_default();
        if let Some(canonical) = &state.canonical {
            info!(commit = %canonical.commit_hash, "canonical code version loaded");
        }
        Self { state, store }
    }

    pub fn canonical(&self) -> Option<&CodeVersion> {
        self.state.canonical.as_ref()
    }

    pub fn canonical_commit(&self) -> Option<String> {
        self.state.canonical.as_ref().map(|v| v.commit_hash.clone())
    }

    pub fn source_node_id(&self) -> Option<&str> {
        self.state.source_node_id.as_deref()
    }

    pub fn is_source_node(&self, node_id: &str) -> bool {
        self.state.source_node_id.as_deref() == Some(node_id)
    }

    /// Git-hook notification: replaces the canonical version unconditionally
    /// and records the reporting node as the code source.
    pub fn apply_git_hook(
        &mut self,
        node_id: &str,
        commit: &str,
        observed_at: Option<DateTime<Utc>>,
    ) {
        info!(node_id, commit = %commit, "canonical code version set by git hook");
        self.state.canonical = Some(CodeVersion {
            commit_hash: commit.to_string(),
            branch: None,
            message: None,
            source: CodeVersionSource::GitHook,
            observed_at: observed_at.unwrap_or_else(Utc::now),
        });
        self.state.source_node_id = Some(node_id.to_string());
        self.snapshot();
    }

    /// Heartbeat from the code-source node: replaces the canonical value only
    /// when the commit actually moved. Returns whether it changed.
    pub fn apply_source_heartbeat(&mut self, commit: &str) -> bool {
        let moved = self
            .state
            .canonical
            .as_ref()
            .is_none_or(|v| v.commit_hash != commit);
        if moved {
            info!(commit = %commit, "canonical code version advanced by heartbeat");
            self.state.canonical = Some(CodeVersion {
                commit_hash: commit.to_string(),
                branch: None,
                message: None,
                source: CodeVersionSource::Heartbeat,
                observed_at: Utc::now(),
            });
            self.snapshot();
        }
        moved
    }

    /// Classify a node's reported commit against the canonical version.
    pub fn classify(&self, reported: Option<&str>) -> CodeStatus {
        match (&self.state.canonical, reported) {
            (Some(canonical), Some(commit)) if canonical.commit_hash == commit => {
                CodeStatus::Current
            }
            (Some(_), Some(_)) => CodeStatus::Outdated,
            _ => CodeStatus::Unknown,
        }
    }

    fn snapshot(&self) {
        let mut rows = HashMap::new();
        rows.insert("state".to_string(), self.state.clone());
        if let Err(e) = self.store.save(&rows) {
            tracing::warn!(error = %e, "failed to snapshot canonical code version");
        }
    }
}
