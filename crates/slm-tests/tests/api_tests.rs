//! API contract tests: auth predicate, validation failures, idempotence,
//! and boundary behavior of the planner endpoints.

use slm_proto::{short_id, Node, UpdateInfo, UpdateJob, UpdateJobStatus, UpdateSeverity};
use slm_server::AppState;
use slm_tests::{spawn_server, test_state, test_state_with_auth, FakeRunner};
use std::sync::Arc;

fn seed_node(state: &AppState, node_id: &str) {
    let mut node = Node::new(node_id);
    node.ip_address = Some("10.0.0.5".to_string());
    node.hostname = Some(format!("{node_id}.fleet"));
    state.registry.write().upsert(node);
}

fn seed_update(state: &AppState, node_id: Option<&str>, package: &str) -> String {
    let update = UpdateInfo {
        update_id: short_id(),
        node_id: node_id.map(String::from),
        package_name: package.to_string(),
        current_version: None,
        available_version: "2.0".to_string(),
        severity: UpdateSeverity::Moderate,
        is_applied: false,
        applied_at: None,
        created_at: chrono::Utc::now(),
    };
    let id = update.update_id.clone();
    state.updates.write().insert(update);
    id
}

// ─── Auth predicate ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_auth_missing_wrong_and_valid_tokens() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state_with_auth(
        dir.path(),
        Arc::new(FakeRunner::new()),
        Some("sekrit".to_string()),
    );
    let base = spawn_server(state).await;
    let client = reqwest::Client::new();

    // Health stays open.
    let resp = client.get(format!("{base}/api/health")).send().await.expect("get");
    assert_eq!(resp.status().as_u16(), 200);

    // Everything else: 401 without credentials, 403 with wrong ones.
    let resp = client.get(format!("{base}/updates/check")).send().await.expect("get");
    assert_eq!(resp.status().as_u16(), 401);

    let resp = client
        .get(format!("{base}/updates/check"))
        .bearer_auth("wrong")
        .send()
        .await
        .expect("get");
    assert_eq!(resp.status().as_u16(), 403);

    let resp = client
        .get(format!("{base}/updates/check"))
        .bearer_auth("sekrit")
        .send()
        .await
        .expect("get");
    assert_eq!(resp.status().as_u16(), 200);

    // WebSocket clients may pass the token as a query parameter.
    let resp = client
        .get(format!("{base}/updates/check?token=sekrit"))
        .send()
        .await
        .expect("get");
    assert_eq!(resp.status().as_u16(), 200);
}

// ─── Heartbeat validation and idempotence ────────────────────────────────────

#[tokio::test]
async fn test_malformed_heartbeat_is_422_and_touches_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));
    let base = spawn_server(state.clone()).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/api/nodes/n1/heartbeat"))
        .header("content-type", "application/json")
        .body("{definitely not json")
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status().as_u16(), 422);

    assert!(state.registry.read().is_empty(), "registry untouched");
    assert!(state.events.read().is_empty(), "no events emitted");
}

#[tokio::test]
async fn test_heartbeat_replay_yields_one_node_row() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));
    let base = spawn_server(state.clone()).await;

    let payload = serde_json::json!({ "cpu_percent": 12.5, "agent_version": "0.1.0" });
    let client = reqwest::Client::new();
    for _ in 0..3 {
        let resp = client
            .post(format!("{base}/api/nodes/n1/heartbeat"))
            .json(&payload)
            .send()
            .await
            .expect("post");
        assert_eq!(resp.status().as_u16(), 200);
    }

    assert_eq!(state.registry.read().len(), 1);
    // Exactly one registration event despite three identical beats.
    let registrations = state
        .events
        .read()
        .for_node("n1", 50)
        .iter()
        .filter(|e| e.event_type == slm_proto::EventType::NodeRegistered)
        .count();
    assert_eq!(registrations, 1);
}

#[tokio::test]
async fn test_heartbeat_with_missing_optional_fields_succeeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));
    let base = spawn_server(state.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/nodes/n1/heartbeat"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status().as_u16(), 200);
    assert!(state.registry.read().get("n1").is_some());
}

// ─── Event sync idempotence ──────────────────────────────────────────────────

#[tokio::test]
async fn test_event_sync_replay_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));
    let base = spawn_server(state.clone()).await;

    let payload = serde_json::json!([
        { "id": 1, "type": "heartbeat", "data": { "node_id": "n1", "cpu_percent": 5.0 } },
        { "id": 2, "type": "heartbeat", "data": { "node_id": "n1", "cpu_percent": 6.0 } },
    ]);

    let client = reqwest::Client::new();
    for _ in 0..2 {
        let resp: serde_json::Value = client
            .post(format!("{base}/api/v1/slm/events/sync"))
            .json(&payload)
            .send()
            .await
            .expect("post")
            .json()
            .await
            .expect("json");
        // Replays are acknowledged so the agent can clear its buffer.
        assert_eq!(resp["accepted"], serde_json::json!([1, 2]));
    }

    assert_eq!(state.events.read().for_node("n1", 50).len(), 2);
}

// ─── Planner boundaries ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_fleet_summary_with_zero_nodes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));
    let base = spawn_server(state).await;

    let summary: serde_json::Value = reqwest::get(format!("{base}/updates/fleet-summary"))
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(summary["nodes"], serde_json::json!([]));
    assert_eq!(summary["total_system_updates"], 0);
    assert_eq!(summary["total_code_updates"], 0);
    assert_eq!(summary["nodes_needing_updates"], 0);
}

#[tokio::test]
async fn test_updates_check_scoping_over_http() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));
    let base = spawn_server(state.clone()).await;

    seed_update(&state, None, "curl");
    seed_update(&state, Some("n1"), "nginx");
    seed_update(&state, Some("n2"), "redis");

    let fleet: serde_json::Value = reqwest::get(format!("{base}/updates/check"))
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(fleet["total"], 1, "fleet scope returns globals only");

    let node: serde_json::Value = reqwest::get(format!("{base}/updates/check?node_id=n1"))
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(node["total"], 2, "node scope includes globals");
}

#[tokio::test]
async fn test_apply_rejects_empty_and_unknown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));
    let base = spawn_server(state.clone()).await;
    let client = reqwest::Client::new();

    seed_node(&state, "n1");

    // Empty update list is rejected at creation.
    let resp = client
        .post(format!("{base}/updates/apply"))
        .json(&serde_json::json!({ "node_id": "n1", "update_ids": [] }))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status().as_u16(), 400);

    // Unknown node.
    let u1 = seed_update(&state, None, "curl");
    let resp = client
        .post(format!("{base}/updates/apply"))
        .json(&serde_json::json!({ "node_id": "ghost", "update_ids": [u1] }))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status().as_u16(), 404);

    // Known node, unknown update ids.
    let resp = client
        .post(format!("{base}/updates/apply"))
        .json(&serde_json::json!({ "node_id": "n1", "update_ids": ["nope"] }))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status().as_u16(), 404);

    assert!(state.jobs.read().list(&Default::default()).is_empty());
}

#[tokio::test]
async fn test_cancel_terminal_job_is_conflict() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));
    let base = spawn_server(state.clone()).await;

    let mut done = UpdateJob::new(short_id(), "n1".to_string(), vec![short_id()]);
    done.status = UpdateJobStatus::Completed;
    done.completed_at = Some(chrono::Utc::now());
    let job_id = done.job_id.clone();
    state.jobs.write().insert(done);

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/updates/jobs/{job_id}/cancel"))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status().as_u16(), 400);

    let resp = client
        .post(format!("{base}/updates/jobs/missing/cancel"))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn test_job_listing_filters() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));
    let base = spawn_server(state.clone()).await;

    let mut a = UpdateJob::new(short_id(), "n1".to_string(), vec![short_id()]);
    a.status = UpdateJobStatus::Completed;
    let mut b = UpdateJob::new(short_id(), "n2".to_string(), vec![short_id()]);
    b.status = UpdateJobStatus::Failed;
    state.jobs.write().insert(a);
    state.jobs.write().insert(b);

    let by_node: serde_json::Value = reqwest::get(format!("{base}/updates/jobs?node_id=n1"))
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(by_node["total"], 1);

    let by_status: serde_json::Value =
        reqwest::get(format!("{base}/updates/jobs?status=failed"))
            .await
            .expect("get")
            .json()
            .await
            .expect("json");
    assert_eq!(by_status["total"], 1);
    assert_eq!(by_status["jobs"][0]["node_id"], "n2");
}

// ─── Node deletion keeps history ─────────────────────────────────────────────

#[tokio::test]
async fn test_delete_node_keeps_events_and_jobs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path(), Arc::new(FakeRunner::new()));
    let base = spawn_server(state.clone()).await;
    let client = reqwest::Client::new();

    // Register via heartbeat, then record a job against the node.
    client
        .post(format!("{base}/api/nodes/n1/heartbeat"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .expect("post");
    let mut job = UpdateJob::new(short_id(), "n1".to_string(), vec![short_id()]);
    job.status = UpdateJobStatus::Completed;
    let job_id = job.job_id.clone();
    state.jobs.write().insert(job);

    let resp = client
        .delete(format!("{base}/api/nodes/n1"))
        .send()
        .await
        .expect("delete");
    assert_eq!(resp.status().as_u16(), 200);
    assert!(state.registry.read().get("n1").is_none());

    // History survives with the node id dangling.
    let resp = client
        .get(format!("{base}/updates/jobs/{job_id}"))
        .send()
        .await
        .expect("get");
    assert_eq!(resp.status().as_u16(), 200);
    let events: serde_json::Value = client
        .get(format!("{base}/api/nodes/n1/events"))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert!(events["total"].as_u64().expect("total") >= 1);
}
