//! Local code-version store.
//!
//! A small `version.json` beside the event buffer records the last commit
//! this node observed, where it came from (git hook or heartbeat), and when.
//! The daemon reads it on every heartbeat; the notify server rewrites it when
//! a git hook fires.

use chrono::Utc;
use parking_lot::RwLock;
use slm_proto::{CodeVersion, CodeVersionSource};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};

pub struct VersionManager {
    path: PathBuf,
    cached: RwLock<Option<CodeVersion>>,
}

impl VersionManager {
    pub fn new(state_dir: &Path) -> Self {
        let path = state_dir.join("version.json");
        let cached = Self::read_file(&path);
        if let Some(version) = &cached {
            debug!(commit = %version.commit_hash, "loaded code version");
        }
        Self {
            path,
            cached: RwLock::new(cached),
        }
    }

    fn read_file(path: &Path) -> Option<CodeVersion> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(version) => Some(version),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable version file");
                None
            }
        }
    }

    /// The commit the node currently reports in heartbeats.
    pub fn current_commit(&self) -> Option<String> {
        self.cached.read().as_ref().map(|v| v.commit_hash.clone())
    }

    pub fn current(&self) -> Option<CodeVersion> {
        self.cached.read().clone()
    }

    /// Record a new observed commit and persist it.
    pub fn save(
        &self,
        commit: &str,
        branch: Option<String>,
        message: Option<String>,
        source: CodeVersionSource,
    ) -> AgentResult<()> {
        let version = CodeVersion {
            commit_hash: commit.to_string(),
            branch,
            // Keep commit subjects bounded; hooks can send whole bodies.
            message: message.map(|m| m.chars().take(200).collect()),
            source,
            observed_at: Utc::now(),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&version)?;
        std::fs::write(&self.path, content)
            .map_err(|e| AgentError::Version(format!("write {}: {e}", self.path.display())))?;
        *self.cached.write() = Some(version);
        Ok(())
    }
}
