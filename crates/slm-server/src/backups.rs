//! Backup execution, verification, and restore.
//!
//! Snapshot flow for Redis-style services: trigger a background save on the
//! node, wait for the save timestamp to advance, checksum the artefact
//! remotely, copy it into controller storage, and checksum again locally.
//! A failed copy degrades to a remote-only completed backup rather than
//! losing the record; a checksum mismatch completes with a warning flag.

use chrono::Utc;
use sha2::{Digest, Sha256};
use slm_persist::SnapshotStore;
use slm_proto::{
    Backup, BackupRestoreResponse, BackupStatus, BackupVerifyResponse, EventSeverity, EventType,
    Node,
};
use slm_exec::CommandRunner;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const AUTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const CONFIG_PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const BGSAVE_TIMEOUT: Duration = Duration::from_secs(30);
const STAT_TIMEOUT: Duration = Duration::from_secs(15);
const CHECKSUM_TIMEOUT: Duration = Duration::from_secs(60);
const COPY_TIMEOUT: Duration = Duration::from_secs(300);
const SERVICE_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(15);

/// Background saves poll the save timestamp this often, up to the cap.
const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const SNAPSHOT_MAX_WAIT: Duration = Duration::from_secs(120);

/// Grace period after a restore restart before health checking.
const RESTART_GRACE: Duration = Duration::from_secs(3);

const DEFAULT_DATA_DIR: &str = "/var/lib/redis";
const DEFAULT_DB_FILENAME: &str = "dump.rdb";

// ─── Store ───────────────────────────────────────────────────────────────────

pub struct BackupStore {
    rows: HashMap<String, Backup>,
    store: SnapshotStore,
}

impl BackupStore {
    pub fn new(state_dir: &std::path::Path) -> Self {
        let store = SnapshotStore::new(state_dir, "backups");
        let rows = store.load();
        Self { rows, store }
    }

    pub fn insert(&mut self, backup: Backup) {
        self.rows.insert(backup.backup_id.clone(), backup);
        self.snapshot();
    }

    pub fn get(&self, backup_id: &str) -> Option<&Backup> {
        self.rows.get(backup_id)
    }

    pub fn update_row(
        &mut self,
        backup_id: &str,
        f: impl FnOnce(&mut Backup),
    ) -> Option<Backup> {
        let backup = self.rows.get_mut(backup_id)?;
        f(backup);
        let backup = backup.clone();
        self.snapshot();
        Some(backup)
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.rows) {
            warn!(error = %e, "failed to snapshot backup store");
        }
    }
}

// ─── Execution ───────────────────────────────────────────────────────────────

/// Systemd unit for a service name; Redis ships as `redis-server`.
fn service_unit(service: &str) -> String {
    if service == "redis" {
        "redis-server".to_string()
    } else {
        service.to_string()
    }
}

/// Dispatch the snapshot flow for a backup row the API just created.
pub fn start_backup(state: &AppState, backup_id: String) {
    let state = state.clone();
    tokio::spawn(async move {
        run_backup(state, backup_id).await;
    });
}

async fn run_backup(state: AppState, backup_id: String) {
    let Some(backup) = state.backups.read().get(&backup_id).cloned() else {
        warn!(backup_id, "backup row not found");
        return;
    };

    let node = state.registry.read().get(&backup.node_id).cloned();
    let Some(node) = node else {
        fail_backup(&state, &backup_id, &backup.node_id, "Node not found");
        return;
    };

    state.backups.write().update_row(&backup_id, |b| {
        b.status = BackupStatus::InProgress;
        b.started_at = Some(Utc::now());
    });
    state.emit_event(
        &node.node_id,
        EventType::BackupStarted,
        EventSeverity::Info,
        format!("Backup {backup_id} started ({})", backup.service),
        serde_json::json!({ "backup_id": backup_id, "service": backup.service }),
    );

    let runner = state.runner_for_node(&node);
    match execute_snapshot(&state, &backup_id, &node, runner).await {
        Ok(()) => {
            let row = state.backups.read().get(&backup_id).cloned();
            let (size, checksum) = row
                .map(|b| (b.size_bytes, b.checksum))
                .unwrap_or((None, None));
            info!(backup_id, size = ?size, "backup completed");
            state.emit_event(
                &node.node_id,
                EventType::BackupCompleted,
                EventSeverity::Info,
                format!("Backup {backup_id} completed"),
                serde_json::json!({
                    "backup_id": backup_id,
                    "size_bytes": size,
                    "checksum": checksum,
                }),
            );
        }
        Err(error) => {
            fail_backup(&state, &backup_id, &node.node_id, &error);
        }
    }
}

fn fail_backup(state: &AppState, backup_id: &str, node_id: &str, error: &str) {
    warn!(backup_id, error, "backup failed");
    let trimmed: String = error.chars().take(500).collect();
    state.backups.write().update_row(backup_id, |b| {
        b.status = BackupStatus::Failed;
        b.error = Some(trimmed.clone());
        b.completed_at = Some(Utc::now());
    });
    state.emit_event(
        node_id,
        EventType::BackupFailed,
        EventSeverity::Error,
        format!("Backup {backup_id} failed: {trimmed}"),
        serde_json::json!({ "backup_id": backup_id, "error": trimmed }),
    );
}

/// The snapshot sequence. Any error string becomes the terminal failure;
/// copy failures are handled inside and still complete the backup.
async fn execute_snapshot(
    state: &AppState,
    backup_id: &str,
    node: &Node,
    runner: Arc<dyn CommandRunner>,
) -> Result<(), String> {
    // Auth discovery: pass the password through the environment so special
    // characters never hit the shell.
    let auth_prefix = discover_auth_prefix(runner.as_ref()).await;

    // Data dir and filename, with cached defaults when the probe fails.
    let config_cmd = format!(
        "{auth_prefix}redis-cli CONFIG GET dir && {auth_prefix}redis-cli CONFIG GET dbfilename"
    );
    let (data_dir, db_filename) = match runner.run(&config_cmd, CONFIG_PROBE_TIMEOUT).await {
        Ok(out) if out.success() => parse_config_pairs(&out.stdout),
        _ => (DEFAULT_DATA_DIR.to_string(), DEFAULT_DB_FILENAME.to_string()),
    };
    let rdb_path = format!("{data_dir}/{db_filename}");
    info!(backup_id, rdb_path = %rdb_path, "snapshot path discovered");

    // Pre-snapshot save timestamp, then trigger the background save.
    let pre_lastsave = read_lastsave(runner.as_ref(), &auth_prefix).await.unwrap_or(0);
    let bgsave = runner
        .run(&format!("{auth_prefix}redis-cli BGSAVE"), BGSAVE_TIMEOUT)
        .await
        .map_err(|e| format!("BGSAVE failed: {e}"))?;
    if !bgsave.success() {
        return Err(format!("BGSAVE failed: {}", bgsave.combined()));
    }

    if !wait_for_snapshot(runner.as_ref(), &auth_prefix, pre_lastsave).await {
        return Err("Backup timed out waiting for snapshot".to_string());
    }

    // Artefact size and remote checksum.
    let size_bytes = read_remote_size(runner.as_ref(), &rdb_path).await;
    let remote_checksum = read_remote_checksum(runner.as_ref(), &rdb_path).await;

    // Copy into controller storage.
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let local_path = state
        .config
        .backup_dir
        .join(format!("{backup_id}_{timestamp}.rdb"));

    match runner.copy_from(&rdb_path, &local_path, COPY_TIMEOUT).await {
        Err(copy_error) => {
            // The snapshot exists on the node; record it rather than lose it.
            warn!(backup_id, error = %copy_error, "copy failed, keeping remote backup");
            let host = node.ip_address.clone().unwrap_or_else(|| node.node_id.clone());
            let mut extra = serde_json::json!({
                "location": "remote",
                "host": host,
                "copy_error": copy_error.to_string(),
            });
            if remote_checksum.is_none() {
                extra["checksum_warning"] =
                    serde_json::Value::String("remote checksum unavailable".to_string());
            }
            state.backups.write().update_row(backup_id, |b| {
                b.status = BackupStatus::Completed;
                b.backup_path = Some(rdb_path.clone());
                b.size_bytes = size_bytes;
                b.checksum = remote_checksum.clone();
                b.extra_data = extra.clone();
                b.completed_at = Some(Utc::now());
            });
        }
        Ok(()) => {
            let local_checksum = sha256_file(&local_path).await;
            let local_size = tokio::fs::metadata(&local_path).await.ok().map(|m| m.len());

            let mut extra = serde_json::json!({
                "location": "local",
                "remote_checksum": remote_checksum,
                "local_checksum": local_checksum,
            });
            if let (Some(remote), Some(local)) = (&remote_checksum, &local_checksum) {
                if remote != local {
                    warn!(backup_id, remote = %remote, local = %local, "checksum mismatch");
                    extra["checksum_warning"] =
                        serde_json::Value::String("mismatch detected".to_string());
                }
            } else if remote_checksum.is_none() && local_checksum.is_none() {
                extra["checksum_warning"] =
                    serde_json::Value::String("no checksum available".to_string());
            }

            state.backups.write().update_row(backup_id, |b| {
                b.status = BackupStatus::Completed;
                b.backup_path = Some(local_path.to_string_lossy().to_string());
                b.size_bytes = local_size.or(size_bytes);
                b.checksum = local_checksum.clone().or_else(|| remote_checksum.clone());
                b.extra_data = extra.clone();
                b.completed_at = Some(Utc::now());
            });
        }
    }

    Ok(())
}

async fn discover_auth_prefix(runner: &dyn CommandRunner) -> String {
    let probe = runner
        .run(
            "grep -E '^requirepass' /etc/redis/redis.conf 2>/dev/null | awk '{print $2}'",
            AUTH_PROBE_TIMEOUT,
        )
        .await;
    match probe {
        Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
            "REDISCLI_AUTH=$(grep -E '^requirepass' /etc/redis/redis.conf | awk '{print $2}') "
                .to_string()
        }
        _ => String::new(),
    }
}

/// Parse `CONFIG GET dir` / `CONFIG GET dbfilename` output: alternating
/// key/value lines.
fn parse_config_pairs(output: &str) -> (String, String) {
    let mut data_dir = DEFAULT_DATA_DIR.to_string();
    let mut db_filename = DEFAULT_DB_FILENAME.to_string();
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    for (i, line) in lines.iter().enumerate() {
        if *line == "dir" && i + 1 < lines.len() {
            data_dir = lines[i + 1].to_string();
        } else if *line == "dbfilename" && i + 1 < lines.len() {
            db_filename = lines[i + 1].to_string();
        }
    }
    (data_dir, db_filename)
}

async fn read_lastsave(runner: &dyn CommandRunner, auth_prefix: &str) -> Option<i64> {
    let out = runner
        .run(&format!("{auth_prefix}redis-cli LASTSAVE"), AUTH_PROBE_TIMEOUT)
        .await
        .ok()?;
    if !out.success() {
        return None;
    }
    out.stdout.trim().lines().last()?.trim().parse().ok()
}

/// Poll until the save timestamp advances past the pre-snapshot reading.
async fn wait_for_snapshot(
    runner: &dyn CommandRunner,
    auth_prefix: &str,
    pre_lastsave: i64,
) -> bool {
    let deadline = tokio::time::Instant::now() + SNAPSHOT_MAX_WAIT;
    loop {
        if let Some(lastsave) = read_lastsave(runner, auth_prefix).await {
            if lastsave > pre_lastsave {
                info!(lastsave, "snapshot completed");
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(SNAPSHOT_POLL_INTERVAL).await;
    }
}

async fn read_remote_size(runner: &dyn CommandRunner, path: &str) -> Option<u64> {
    let out = runner
        .run(
            &format!("stat -c '%s' {path} 2>/dev/null || echo '0'"),
            STAT_TIMEOUT,
        )
        .await
        .ok()?;
    out.stdout.trim().lines().last()?.trim().parse().ok()
}

async fn read_remote_checksum(runner: &dyn CommandRunner, path: &str) -> Option<String> {
    let out = runner
        .run(
            &format!("sha256sum {path} 2>/dev/null | cut -d' ' -f1"),
            CHECKSUM_TIMEOUT,
        )
        .await
        .ok()?;
    let checksum = out.stdout.trim().to_string();
    (out.success() && checksum.len() == 64).then_some(checksum)
}

/// SHA-256 of a local file, streamed off the async runtime.
pub async fn sha256_file(path: &Path) -> Option<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut file = std::fs::File::open(&path).ok()?;
        let mut hasher = Sha256::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = file.read(&mut chunk).ok()?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
        }
        Some(hex::encode(hasher.finalize()))
    })
    .await
    .ok()
    .flatten()
}

// ─── Restore ─────────────────────────────────────────────────────────────────

/// Restore a completed backup onto a target node. Operational failures
/// return `success = false` with the reason; the operator intervenes — there
/// is no automatic rollback.
pub async fn run_restore(
    state: &AppState,
    backup_id: &str,
    target_node_id: &str,
) -> ApiResult<BackupRestoreResponse> {
    let backup = state
        .backups
        .read()
        .get(backup_id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound("Backup not found".to_string()))?;

    if backup.status != BackupStatus::Completed {
        return Err(ApiError::Conflict(format!(
            "Cannot restore backup in status: {}",
            backup.status
        )));
    }

    let node = state
        .registry
        .read()
        .get(target_node_id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound("Target node not found".to_string()))?;

    let runner = state.runner_for_node(&node);
    let unit = service_unit(&backup.service);

    info!(backup_id, target = target_node_id, "stopping service for restore");
    let _ = runner
        .run(&format!("sudo systemctl stop {unit}"), SERVICE_TIMEOUT)
        .await;

    let backup_path = backup.backup_path.clone().unwrap_or_default();
    let is_local = backup.extra_data.get("location").and_then(|v| v.as_str()) == Some("local");

    if is_local {
        let local = PathBuf::from(&backup_path);
        if runner
            .copy_to(&local, "/tmp/restore.rdb", COPY_TIMEOUT)
            .await
            .is_err()
        {
            return Ok(restore_failure("Failed to copy backup to target"));
        }
        let mv_cmd = format!(
            "sudo mv /tmp/restore.rdb {DEFAULT_DATA_DIR}/{DEFAULT_DB_FILENAME} && \
             sudo chown redis:redis {DEFAULT_DATA_DIR}/{DEFAULT_DB_FILENAME}"
        );
        match runner.run(&mv_cmd, SERVICE_TIMEOUT).await {
            Ok(out) if out.success() => {}
            Ok(out) => {
                return Ok(restore_failure(&format!(
                    "Failed to move backup file: {}",
                    out.combined()
                )))
            }
            Err(e) => return Ok(restore_failure(&format!("Failed to move backup file: {e}"))),
        }
    } else {
        // Artefact lives on the node already; just confirm it exists.
        let check = runner
            .run(&format!("test -f {backup_path} && echo 'exists'"), AUTH_PROBE_TIMEOUT)
            .await;
        match check {
            Ok(out) if out.success() && out.stdout.contains("exists") => {}
            _ => return Ok(restore_failure("Backup file not found on target")),
        }
    }

    info!(backup_id, target = target_node_id, "starting service after restore");
    match runner
        .run(&format!("sudo systemctl start {unit}"), SERVICE_TIMEOUT)
        .await
    {
        Ok(out) if out.success() => {}
        Ok(out) => {
            return Ok(restore_failure(&format!(
                "Failed to start {unit}: {}",
                out.combined()
            )))
        }
        Err(e) => return Ok(restore_failure(&format!("Failed to start {unit}: {e}"))),
    }

    tokio::time::sleep(RESTART_GRACE).await;

    let verify = runner
        .run("redis-cli PING && redis-cli DBSIZE", HEALTH_TIMEOUT)
        .await;
    match verify {
        Ok(out) if out.success() && out.stdout.contains("PONG") => {
            info!(backup_id, target = target_node_id, "restore completed");
            Ok(BackupRestoreResponse {
                success: true,
                message: format!("Restore completed. Service status: {}", out.stdout.trim()),
            })
        }
        Ok(out) => Ok(restore_failure(&format!(
            "Service not healthy after restore: {}",
            out.combined()
        ))),
        Err(e) => Ok(restore_failure(&format!(
            "Service not healthy after restore: {e}"
        ))),
    }
}

fn restore_failure(message: &str) -> BackupRestoreResponse {
    warn!(message, "restore failed");
    BackupRestoreResponse {
        success: false,
        message: message.to_string(),
    }
}

// ─── Verify ──────────────────────────────────────────────────────────────────

/// Recompute the local artefact's SHA-256 and compare to the stored value.
pub async fn verify_backup(state: &AppState, backup_id: &str) -> ApiResult<BackupVerifyResponse> {
    let backup = state
        .backups
        .read()
        .get(backup_id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound("Backup not found".to_string()))?;

    let Some(path) = backup.backup_path.as_deref() else {
        return Ok(BackupVerifyResponse {
            valid: false,
            backup_id: Some(backup_id.to_string()),
            checksum: None,
            size_bytes: None,
            expected_checksum: None,
            actual_checksum: None,
            message: None,
            warning: None,
            error: Some("Backup file not found".to_string()),
        });
    };

    let Some(actual) = sha256_file(Path::new(path)).await else {
        return Ok(BackupVerifyResponse {
            valid: false,
            backup_id: Some(backup_id.to_string()),
            checksum: None,
            size_bytes: None,
            expected_checksum: None,
            actual_checksum: None,
            message: None,
            warning: None,
            error: Some("Backup file not found".to_string()),
        });
    };

    let response = match &backup.checksum {
        Some(expected) if *expected == actual => BackupVerifyResponse {
            valid: true,
            backup_id: Some(backup_id.to_string()),
            checksum: Some(actual),
            size_bytes: backup.size_bytes,
            expected_checksum: None,
            actual_checksum: None,
            message: Some("Backup integrity verified".to_string()),
            warning: None,
            error: None,
        },
        Some(expected) => BackupVerifyResponse {
            valid: false,
            backup_id: Some(backup_id.to_string()),
            checksum: None,
            size_bytes: backup.size_bytes,
            expected_checksum: Some(expected.clone()),
            actual_checksum: Some(actual),
            message: None,
            warning: None,
            error: Some("Checksum mismatch - backup may be corrupted".to_string()),
        },
        None => BackupVerifyResponse {
            valid: true,
            backup_id: Some(backup_id.to_string()),
            checksum: Some(actual),
            size_bytes: backup.size_bytes,
            expected_checksum: None,
            actual_checksum: None,
            message: None,
            warning: Some("No stored checksum to verify against".to_string()),
            error: None,
        },
    };
    Ok(response)
}
