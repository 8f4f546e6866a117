//! Durable on-disk event buffer.
//!
//! Events queue here whenever the controller is unreachable and drain in
//! batches once connectivity returns. Backed by a single SQLite file with a
//! monotonic id and a `synced` flag; delivery is at-least-once and the
//! controller dedupes on `(node_id, event_id)`.
//!
//! A corrupt store never blocks `append`: the bad file is moved aside and a
//! fresh one created in place.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, AgentResult};

/// One buffered event awaiting sync.
#[derive(Debug, Clone)]
pub struct BufferedEvent {
    pub id: i64,
    pub timestamp: String,
    pub event_type: String,
    pub data: serde_json::Value,
}

pub struct EventBuffer {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl EventBuffer {
    /// Open (or create) the buffer at `path`. An unreadable existing file is
    /// renamed aside and replaced with a fresh store.
    pub fn open(path: &Path) -> AgentResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = match Self::open_conn(path) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "event buffer unreadable, starting fresh");
                Self::quarantine(path);
                Self::open_conn(path).map_err(|e| AgentError::Buffer(e.to_string()))?
            }
        };
        info!(path = %path.display(), "event buffer initialized");
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    fn open_conn(path: &Path) -> rusqlite::Result<Connection> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS event_buffer (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                data TEXT NOT NULL,
                synced INTEGER DEFAULT 0
            )",
        )?;
        Ok(conn)
    }

    fn quarantine(path: &Path) {
        let aside = path.with_extension("db.corrupt");
        if let Err(e) = std::fs::rename(path, &aside) {
            warn!(path = %path.display(), error = %e, "could not move corrupt buffer aside");
            let _ = std::fs::remove_file(path);
        }
    }

    fn insert(conn: &Connection, event_type: &str, data: &serde_json::Value) -> rusqlite::Result<i64> {
        conn.execute(
            "INSERT INTO event_buffer (timestamp, event_type, data) VALUES (?1, ?2, ?3)",
            (
                Utc::now().to_rfc3339(),
                event_type,
                serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string()),
            ),
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Append an event. Returns the assigned id, or `None` only if even a
    /// fresh store could not be written — the caller logs and carries on.
    pub fn append(&self, event_type: &str, data: &serde_json::Value) -> Option<i64> {
        let mut conn = self.conn.lock();
        match Self::insert(&conn, event_type, data) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "buffer append failed, recreating store");
                Self::quarantine(&self.path);
                match Self::open_conn(&self.path) {
                    Ok(fresh) => {
                        *conn = fresh;
                        Self::insert(&conn, event_type, data).ok()
                    }
                    Err(e) => {
                        error!(error = %e, "could not recreate event buffer");
                        None
                    }
                }
            }
        }
    }

    /// Unsynced events in id order, up to `limit`.
    pub fn pending(&self, limit: usize) -> Vec<BufferedEvent> {
        let conn = self.conn.lock();
        let mut stmt = match conn.prepare(
            "SELECT id, timestamp, event_type, data FROM event_buffer
             WHERE synced = 0 ORDER BY id LIMIT ?1",
        ) {
            Ok(stmt) => stmt,
            Err(e) => {
                warn!(error = %e, "buffer read failed");
                return Vec::new();
            }
        };

        let rows = stmt.query_map([limit as i64], |row| {
            let data: String = row.get(3)?;
            Ok(BufferedEvent {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                event_type: row.get(2)?,
                data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
            })
        });

        match rows {
            Ok(iter) => iter.filter_map(|r| r.ok()).collect(),
            Err(e) => {
                warn!(error = %e, "buffer read failed");
                Vec::new()
            }
        }
    }

    /// Flag the given ids as delivered.
    pub fn mark_synced(&self, ids: &[i64]) {
        if ids.is_empty() {
            return;
        }
        let conn = self.conn.lock();
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("UPDATE event_buffer SET synced = 1 WHERE id IN ({placeholders})");
        let params: Vec<&dyn rusqlite::ToSql> =
            ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        match conn.execute(&sql, params.as_slice()) {
            Ok(n) => debug!(marked = n, "events marked synced"),
            Err(e) => warn!(error = %e, "failed to mark events synced"),
        }
    }

    /// Number of events still awaiting delivery.
    pub fn unsynced_count(&self) -> u64 {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM event_buffer WHERE synced = 0",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_and_pending_in_id_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let buffer = EventBuffer::open(&dir.path().join("events.db")).expect("open");

        let a = buffer.append("heartbeat", &json!({"cpu_percent": 1.0})).unwrap();
        let b = buffer.append("heartbeat", &json!({"cpu_percent": 2.0})).unwrap();
        let c = buffer.append("code_change", &json!({"commit": "abc"})).unwrap();
        assert!(a < b && b < c);

        let pending = buffer.pending(100);
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].id, a);
        assert_eq!(pending[2].event_type, "code_change");
        assert_eq!(pending[1].data["cpu_percent"], 2.0);
    }

    #[test]
    fn test_mark_synced_removes_from_pending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let buffer = EventBuffer::open(&dir.path().join("events.db")).expect("open");

        let a = buffer.append("heartbeat", &json!({})).unwrap();
        let b = buffer.append("heartbeat", &json!({})).unwrap();
        buffer.mark_synced(&[a]);

        let pending = buffer.pending(100);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b);
        assert_eq!(buffer.unsynced_count(), 1);
    }

    #[test]
    fn test_pending_respects_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let buffer = EventBuffer::open(&dir.path().join("events.db")).expect("open");
        for _ in 0..150 {
            buffer.append("heartbeat", &json!({}));
        }
        assert_eq!(buffer.pending(100).len(), 100);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.db");
        {
            let buffer = EventBuffer::open(&path).expect("open");
            buffer.append("heartbeat", &json!({"n": 1}));
        }
        let buffer = EventBuffer::open(&path).expect("reopen");
        assert_eq!(buffer.unsynced_count(), 1);
    }

    #[test]
    fn test_corrupt_file_recovered_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.db");
        std::fs::write(&path, b"this is not a sqlite database, definitely").expect("write");

        let buffer = EventBuffer::open(&path).expect("open despite corruption");
        let id = buffer.append("heartbeat", &json!({}));
        assert!(id.is_some());
        assert!(path.with_extension("db.corrupt").exists());
    }
}
