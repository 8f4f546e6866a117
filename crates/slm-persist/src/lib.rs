//! JSON file-backed persistence for SLM controller state.
//!
//! Provides [`SnapshotStore`], a generic keyed store that holds a domain of
//! rows in memory and snapshots them to `{state_dir}/{domain}.json` on every
//! write. A corrupt or missing file loads as empty; saves go through a temp
//! file and rename so a crash mid-write never truncates the previous snapshot.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A JSON file-backed store for one domain of keyed rows.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Create a store for `domain` under `state_dir`.
    pub fn new(state_dir: &Path, domain: &str) -> Self {
        let path = state_dir.join(format!("{domain}.json"));
        Self { path }
    }

    /// Load rows from disk. Missing or unreadable files yield an empty map;
    /// a corrupt file is logged and treated as empty rather than fatal.
    pub fn load<T: for<'de> Deserialize<'de>>(&self) -> HashMap<String, T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt snapshot, starting fresh");
                HashMap::new()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no snapshot, starting fresh");
                HashMap::new()
            }
        }
    }

    /// Persist rows to disk via temp-file + rename. Creates parent
    /// directories as needed.
    pub fn save<T: Serialize>(&self, rows: &HashMap<String, T>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(rows).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)
    }

    /// Path of the backing file (for diagnostics and tests).
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), "nodes");

        let mut rows = HashMap::new();
        rows.insert("n1".to_string(), "alpha".to_string());
        rows.insert("n2".to_string(), "beta".to_string());
        store.save(&rows).expect("save");

        let loaded: HashMap<String, String> = store.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("n1").unwrap(), "alpha");
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), "absent");
        let loaded: HashMap<String, String> = store.load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("jobs.json"), "{not json").expect("write");
        let store = SnapshotStore::new(dir.path(), "jobs");
        let loaded: HashMap<String, String> = store.load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_save_creates_nested_dirs_and_leaves_no_tmp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let deep = dir.path().join("state").join("slm");
        let store = SnapshotStore::new(&deep, "backups");

        let mut rows = HashMap::new();
        rows.insert("b1".to_string(), 42u64);
        store.save(&rows).expect("save with nested dirs");

        assert!(store.path().exists());
        assert!(!store.path().with_extension("json.tmp").exists());
        let loaded: HashMap<String, u64> = store.load();
        assert_eq!(loaded.get("b1"), Some(&42));
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), "updates");

        let mut rows = HashMap::new();
        rows.insert("u1".to_string(), "first".to_string());
        store.save(&rows).expect("save1");
        rows.insert("u1".to_string(), "second".to_string());
        store.save(&rows).expect("save2");

        let loaded: HashMap<String, String> = store.load();
        assert_eq!(loaded.get("u1").unwrap(), "second");
    }
}
