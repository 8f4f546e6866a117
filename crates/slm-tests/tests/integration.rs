//! End-to-end flows across the SLM crates:
//! - Agent buffering while the controller is down, then drain-on-reconnect
//! - Update rollout with live progress, mid-run polling, and completion
//! - Cooperative cancellation mid-job
//! - Backup, verify, corruption detection, and degraded remote-only copy
//! - Code-drift detection through the git-hook notify path
//! - WebSocket fan-out with a dead subscriber

use slm_proto::{
    short_id, BackupStatus, CodeStatus, EventType, Node, UpdateInfo, UpdateJob, UpdateJobStatus,
    UpdateSeverity,
};
use slm_server::AppState;
use slm_tests::{spawn_server, test_state, FakeRunner, InstallStep};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn seed_node(state: &AppState, node_id: &str) {
    let mut node = Node::new(node_id);
    node.ip_address = Some("10.0.0.5".to_string());
    node.ssh_user = Some("slm".to_string());
    node.ssh_port = Some(22);
    node.hostname = Some(format!("{node_id}.fleet"));
    state.registry.write().upsert(node);
}

fn seed_update(state: &AppState, node_id: Option<&str>, package: &str) -> String {
    let update = UpdateInfo {
        update_id: short_id(),
        node_id: node_id.map(String::from),
        package_name: package.to_string(),
        current_version: Some("7.88".to_string()),
        available_version: "7.89".to_string(),
        severity: UpdateSeverity::Important,
        is_applied: false,
        applied_at: None,
        created_at: chrono::Utc::now(),
    };
    let id = update.update_id.clone();
    state.updates.write().insert(update);
    id
}

fn job(state: &AppState, job_id: &str) -> UpdateJob {
    state.jobs.read().get(job_id).cloned().expect("job row")
}

async fn wait_until(what: &str, timeout_ms: u64, f: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while !f() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ─── Scenario 1: agent joins through an outage ───────────────────────────────

#[tokio::test]
async fn test_join_buffers_offline_then_drains() {
    use slm_agent::{AgentConfig, SlmAgent};

    let dir = tempfile::tempdir().expect("tempdir");
    let buffer_db = dir.path().join("agent").join("events.db");

    let offline_config = AgentConfig {
        admin_url: "http://127.0.0.1:9".to_string(),
        node_id: "n1".to_string(),
        heartbeat_interval_secs: 30,
        services: vec![],
        buffer_db: buffer_db.clone(),
        code_source: false,
        notify_port: 0,
        insecure: false,
    };

    // Controller down: three heartbeats, all buffered.
    {
        let agent = Arc::new(SlmAgent::new(offline_config.clone()).expect("agent"));
        for _ in 0..3 {
            assert!(!agent.send_heartbeat().await);
        }
    }

    // Controller comes up; the agent reconnects with the same buffer.
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));
    let base = spawn_server(state.clone()).await;

    let online_config = AgentConfig {
        admin_url: base,
        ..offline_config
    };
    let agent = Arc::new(SlmAgent::new(online_config).expect("agent"));
    assert!(agent.send_heartbeat().await);
    agent.sync_buffered_events().await;

    // Node registered with live metrics, three buffered heartbeats recorded.
    let node = state.registry.read().get("n1").cloned().expect("node row");
    assert!(node.last_seen.is_some());
    assert!(node.memory_percent.is_some());

    let events = state.events.read().for_node("n1", 50);
    let heartbeats = events
        .iter()
        .filter(|e| e.event_type == EventType::Heartbeat)
        .count();
    assert_eq!(heartbeats, 3);

    // A second sync offers nothing — everything is marked synced.
    agent.sync_buffered_events().await;
    assert_eq!(state.events.read().for_node("n1", 50).len(), events.len());
}

// ─── Scenario 2: update rollout with mid-run polling ─────────────────────────

#[tokio::test]
async fn test_update_rollout_completes_and_applies() {
    let gate = Arc::new(Semaphore::new(0));
    let runner = Arc::new(FakeRunner::with_installs(vec![InstallStep::OkGated(
        Arc::clone(&gate),
        "Setting up curl (7.89) ...",
    )]));
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::clone(&runner));
    let base = spawn_server(state.clone()).await;

    seed_node(&state, "n1");
    let u1 = seed_update(&state, None, "curl");

    let client = reqwest::Client::new();
    let resp: serde_json::Value = client
        .post(format!("{base}/updates/apply"))
        .json(&serde_json::json!({ "node_id": "n1", "update_ids": [u1] }))
        .send()
        .await
        .expect("apply")
        .json()
        .await
        .expect("json");
    assert_eq!(resp["success"], true);
    let job_id = resp["job_id"].as_str().expect("job id").to_string();

    // Mid-run: the job is observable as running with progress 0.
    wait_until("job running", 2_000, || {
        job(&state, &job_id).status == UpdateJobStatus::Running
    })
    .await;
    let polled: UpdateJob = client
        .get(format!("{base}/updates/jobs/{job_id}"))
        .send()
        .await
        .expect("get job")
        .json()
        .await
        .expect("json");
    assert_eq!(polled.status, UpdateJobStatus::Running);
    assert_eq!(polled.progress, 0);
    assert!(polled
        .current_step
        .as_deref()
        .unwrap_or_default()
        .contains("curl"));

    // Let the install finish and watch it complete.
    gate.add_permits(1);
    wait_until("job terminal", 5_000, || {
        job(&state, &job_id).status.is_terminal()
    })
    .await;

    let done = job(&state, &job_id);
    assert_eq!(done.status, UpdateJobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.completed_steps, 1);
    assert_eq!(done.current_step.as_deref(), Some("Completed"));
    assert!(done.completed_at.expect("completed_at") >= done.started_at.expect("started_at"));
    assert!(done.output.unwrap_or_default().contains("Setting up curl"));

    let update = state.updates.read().get(&u1).cloned().expect("update");
    assert!(update.is_applied);
    assert!(update.applied_at.is_some());

    let events = state.events.read().for_node("n1", 50);
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::DeploymentCompleted));
}

// ─── Scenario 3: cancel mid-run ──────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_mid_run_keeps_first_package() {
    let gate = Arc::new(Semaphore::new(0));
    let runner = Arc::new(FakeRunner::with_installs(vec![
        InstallStep::Ok("Setting up pkg-one (1.1)"),
        InstallStep::OkGated(Arc::clone(&gate), "Setting up pkg-two (2.2)"),
        InstallStep::Ok("Setting up pkg-three (3.3)"),
    ]));
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::clone(&runner));
    let base = spawn_server(state.clone()).await;

    seed_node(&state, "n1");
    let u1 = seed_update(&state, Some("n1"), "pkg-one");
    let u2 = seed_update(&state, Some("n1"), "pkg-two");
    let u3 = seed_update(&state, Some("n1"), "pkg-three");

    let client = reqwest::Client::new();
    let resp: serde_json::Value = client
        .post(format!("{base}/updates/apply"))
        .json(&serde_json::json!({ "node_id": "n1", "update_ids": [u1, u2, u3] }))
        .send()
        .await
        .expect("apply")
        .json()
        .await
        .expect("json");
    let job_id = resp["job_id"].as_str().expect("job id").to_string();

    // First package lands; the second is in flight behind the gate.
    wait_until("second step in flight", 3_000, || {
        let j = job(&state, &job_id);
        j.completed_steps == 1
            && j.current_step.as_deref().unwrap_or_default().contains("pkg-two")
    })
    .await;

    let cancel: serde_json::Value = client
        .post(format!("{base}/updates/jobs/{job_id}/cancel"))
        .send()
        .await
        .expect("cancel")
        .json()
        .await
        .expect("json");
    assert_eq!(cancel["success"], true);

    // Cancelling an already-terminal job is a 400 conflict.
    let again = client
        .post(format!("{base}/updates/jobs/{job_id}/cancel"))
        .send()
        .await
        .expect("cancel again");
    assert_eq!(again.status().as_u16(), 400);

    // Release the gated install: its subprocess finishes but the result is
    // discarded; output is retained.
    gate.add_permits(1);
    wait_until("second install output retained", 3_000, || {
        job(&state, &job_id)
            .output
            .unwrap_or_default()
            .contains("pkg-two")
    })
    .await;

    let cancelled = job(&state, &job_id);
    assert_eq!(cancelled.status, UpdateJobStatus::Cancelled);
    assert_eq!(cancelled.completed_steps, 1);
    assert!(cancelled.completed_at.is_some());
    let output = cancelled.output.unwrap_or_default();
    assert!(output.contains("pkg-one"));
    assert!(output.contains("pkg-two"));

    let updates = state.updates.read().get_many(&[u1, u2, u3]);
    assert!(updates[0].is_applied, "first package stays applied");
    assert!(!updates[1].is_applied, "cancelled install is discarded");
    assert!(!updates[2].is_applied, "third package never attempted");
}

// ─── Scenario 4: backup, verify, corrupt ─────────────────────────────────────

#[tokio::test]
async fn test_backup_verify_and_corruption() {
    let runner = Arc::new(FakeRunner::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::clone(&runner));
    let base = spawn_server(state.clone()).await;

    seed_node(&state, "n1");

    let client = reqwest::Client::new();
    let resp: serde_json::Value = client
        .post(format!("{base}/backups/run"))
        .json(&serde_json::json!({ "node_id": "n1", "service": "redis" }))
        .send()
        .await
        .expect("run")
        .json()
        .await
        .expect("json");
    let backup_id = resp["backup_id"].as_str().expect("backup id").to_string();

    wait_until("backup terminal", 5_000, || {
        state
            .backups
            .read()
            .get(&backup_id)
            .map(|b| b.status.is_terminal())
            .unwrap_or(false)
    })
    .await;

    let backup = state.backups.read().get(&backup_id).cloned().expect("row");
    assert_eq!(backup.status, BackupStatus::Completed);
    assert_eq!(backup.checksum.as_deref(), Some(runner.snapshot_checksum().as_str()));
    assert_eq!(backup.extra_data["location"], "local");
    let path = backup.backup_path.clone().expect("path");
    assert!(std::path::Path::new(&path).exists());

    // Verify: clean pass.
    let verify: serde_json::Value = client
        .get(format!("{base}/backups/{backup_id}/verify"))
        .send()
        .await
        .expect("verify")
        .json()
        .await
        .expect("json");
    assert_eq!(verify["valid"], true);
    assert_eq!(verify["checksum"].as_str().expect("checksum").len(), 64);

    // Truncate the artefact by one byte and verify again.
    let mut bytes = std::fs::read(&path).expect("read");
    bytes.pop();
    std::fs::write(&path, &bytes).expect("write");

    let verify: serde_json::Value = client
        .get(format!("{base}/backups/{backup_id}/verify"))
        .send()
        .await
        .expect("verify")
        .json()
        .await
        .expect("json");
    assert_eq!(verify["valid"], false);
    assert_eq!(
        verify["expected_checksum"].as_str().expect("expected"),
        runner.snapshot_checksum()
    );
    assert_ne!(verify["actual_checksum"], verify["expected_checksum"]);

    let events = state.events.read().for_node("n1", 50);
    assert!(events.iter().any(|e| e.event_type == EventType::BackupStarted));
    assert!(events.iter().any(|e| e.event_type == EventType::BackupCompleted));
}

#[tokio::test]
async fn test_backup_copy_failure_degrades_to_remote() {
    let runner = Arc::new(FakeRunner::with_failing_copy());
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::clone(&runner));

    seed_node(&state, "n1");
    let backup_id = short_id();
    state.backups.write().insert(slm_proto::Backup::new(
        backup_id.clone(),
        "n1".to_string(),
        "redis".to_string(),
    ));
    slm_server::backups::start_backup(&state, backup_id.clone());

    wait_until("backup terminal", 5_000, || {
        state
            .backups
            .read()
            .get(&backup_id)
            .map(|b| b.status.is_terminal())
            .unwrap_or(false)
    })
    .await;

    // The remote snapshot is authoritative: completed, not failed.
    let backup = state.backups.read().get(&backup_id).cloned().expect("row");
    assert_eq!(backup.status, BackupStatus::Completed);
    assert_eq!(backup.extra_data["location"], "remote");
    assert!(backup.extra_data["copy_error"]
        .as_str()
        .unwrap_or_default()
        .contains("scp"));
    assert_eq!(backup.backup_path.as_deref(), Some("/var/lib/redis/dump.rdb"));
    assert_eq!(backup.checksum.as_deref(), Some(runner.snapshot_checksum().as_str()));
}

#[tokio::test]
async fn test_restore_requires_completed_backup_then_succeeds() {
    let runner = Arc::new(FakeRunner::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::clone(&runner));
    let base = spawn_server(state.clone()).await;
    let client = reqwest::Client::new();

    seed_node(&state, "n1");
    seed_node(&state, "n2");

    // A pending backup cannot be restored.
    let pending_id = short_id();
    state.backups.write().insert(slm_proto::Backup::new(
        pending_id.clone(),
        "n1".to_string(),
        "redis".to_string(),
    ));
    let resp = client
        .post(format!("{base}/backups/restore"))
        .json(&serde_json::json!({ "backup_id": pending_id, "target_node_id": "n2" }))
        .send()
        .await
        .expect("restore");
    assert_eq!(resp.status().as_u16(), 400);

    // Run a backup to completion, then restore it onto another node.
    let resp: serde_json::Value = client
        .post(format!("{base}/backups/run"))
        .json(&serde_json::json!({ "node_id": "n1", "service": "redis" }))
        .send()
        .await
        .expect("run")
        .json()
        .await
        .expect("json");
    let backup_id = resp["backup_id"].as_str().expect("backup id").to_string();
    wait_until("backup terminal", 5_000, || {
        state
            .backups
            .read()
            .get(&backup_id)
            .map(|b| b.status.is_terminal())
            .unwrap_or(false)
    })
    .await;

    let restore: serde_json::Value = client
        .post(format!("{base}/backups/restore"))
        .json(&serde_json::json!({ "backup_id": backup_id, "target_node_id": "n2" }))
        .send()
        .await
        .expect("restore")
        .json()
        .await
        .expect("json");
    assert_eq!(restore["success"], true);
    assert!(restore["message"]
        .as_str()
        .expect("message")
        .contains("Restore completed"));

    // The target service was stopped, repopulated, started, and probed.
    let commands = runner.commands();
    assert!(commands.iter().any(|c| c.contains("systemctl stop redis-server")));
    assert!(commands.iter().any(|c| c.contains("systemctl start redis-server")));
    assert!(commands.iter().any(|c| c.contains("PING")));
}

// ─── Scenario 5: code drift ──────────────────────────────────────────────────

#[tokio::test]
async fn test_code_drift_detection_flow() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));
    let base = spawn_server(state.clone()).await;
    let client = reqwest::Client::new();

    // Code-source node n0 reports commit A via git hook.
    let resp = client
        .post(format!("{base}/api/code-sync/notify"))
        .json(&serde_json::json!({
            "node_id": "n0",
            "commit": "commit-a",
            "is_code_source": true,
        }))
        .send()
        .await
        .expect("notify");
    assert_eq!(resp.status().as_u16(), 200);

    // n1 heartbeats with commit A: current, nothing to update.
    let beat: serde_json::Value = client
        .post(format!("{base}/api/nodes/n1/heartbeat"))
        .json(&serde_json::json!({ "code_version": "commit-a" }))
        .send()
        .await
        .expect("heartbeat")
        .json()
        .await
        .expect("json");
    assert_eq!(beat["update_available"], false);
    assert_eq!(
        state.registry.read().get("n1").unwrap().code_status,
        CodeStatus::Current
    );

    // The hook advances canonical to commit B.
    client
        .post(format!("{base}/api/code-sync/notify"))
        .json(&serde_json::json!({
            "node_id": "n0",
            "commit": "commit-b",
            "is_code_source": true,
        }))
        .send()
        .await
        .expect("notify");

    // n1 still reports A: outdated, update advertised, drift event emitted.
    let beat: serde_json::Value = client
        .post(format!("{base}/api/nodes/n1/heartbeat"))
        .json(&serde_json::json!({ "code_version": "commit-a" }))
        .send()
        .await
        .expect("heartbeat")
        .json()
        .await
        .expect("json");
    assert_eq!(beat["update_available"], true);
    assert_eq!(beat["latest_version"], "commit-b");
    assert_eq!(
        state.registry.read().get("n1").unwrap().code_status,
        CodeStatus::Outdated
    );

    let drift_events = || {
        state
            .events
            .read()
            .for_node("n1", 50)
            .iter()
            .filter(|e| e.event_type == EventType::CodeDriftDetected)
            .count()
    };
    assert_eq!(drift_events(), 1);

    // Staying outdated does not repeat the event.
    client
        .post(format!("{base}/api/nodes/n1/heartbeat"))
        .json(&serde_json::json!({ "code_version": "commit-a" }))
        .send()
        .await
        .expect("heartbeat");
    assert_eq!(drift_events(), 1);

    // Catching up clears the drift.
    let beat: serde_json::Value = client
        .post(format!("{base}/api/nodes/n1/heartbeat"))
        .json(&serde_json::json!({ "code_version": "commit-b" }))
        .send()
        .await
        .expect("heartbeat")
        .json()
        .await
        .expect("json");
    assert_eq!(beat["update_available"], false);
    assert_eq!(
        state.registry.read().get("n1").unwrap().code_status,
        CodeStatus::Current
    );
}

// ─── Scenario 6: WebSocket fan-out ───────────────────────────────────────────

#[tokio::test]
async fn test_ws_fanout_drops_closed_subscriber() {
    use futures_util::StreamExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));
    let base = spawn_server(state.clone()).await;
    let ws_url = format!(
        "{}/ws/events?topic=jobs:j1",
        base.replace("http://", "ws://")
    );

    let (live, _) = tokio_tungstenite::connect_async(&ws_url).await.expect("connect");
    let (doomed, _) = tokio_tungstenite::connect_async(&ws_url).await.expect("connect");

    wait_until("both subscribed", 2_000, || {
        state.bus.subscriber_count("jobs:j1") == 2
    })
    .await;

    // One subscriber goes away.
    drop(doomed);
    tokio::time::sleep(Duration::from_millis(100)).await;

    for progress in 0..50u8 {
        state.publish_job_progress("j1", "running", progress, Some("step"));
    }

    // The live subscriber receives all 50 frames in order.
    let (_, mut read) = live.split();
    for expected in 0..50u64 {
        let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
            .await
            .expect("frame timeout")
            .expect("stream open")
            .expect("frame");
        let frame: serde_json::Value =
            serde_json::from_str(msg.to_text().expect("text")).expect("json");
        assert_eq!(frame["type"], "update_job_progress");
        assert_eq!(frame["data"]["progress"], expected);
    }

    // The closed one is cleaned up; publishing never errored.
    wait_until("dead subscriber cleaned", 2_000, || {
        state.bus.subscriber_count("jobs:j1") == 1
    })
    .await;
}

// ─── Background validation failures ──────────────────────────────────────────

#[tokio::test]
async fn test_job_fails_when_node_vanishes_before_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));

    let u1 = seed_update(&state, None, "curl");
    let job_id = short_id();
    state.jobs.write().insert(UpdateJob::new(
        job_id.clone(),
        "ghost".to_string(),
        vec![u1],
    ));
    slm_server::jobs::start_job(&state, job_id.clone());

    wait_until("job terminal", 2_000, || {
        job(&state, &job_id).status.is_terminal()
    })
    .await;

    let failed = job(&state, &job_id);
    assert_eq!(failed.status, UpdateJobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("Node not found"));
    assert!(failed.completed_at.is_some());
    assert!(state.running_jobs.lock().is_empty());
}
