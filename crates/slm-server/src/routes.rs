//! Controller HTTP API.
//!
//! Every route except `/api/health` sits behind the bearer-token predicate:
//! missing credentials are 401, wrong ones 403. Malformed heartbeat bodies
//! are 422 and touch nothing; malformed bodies elsewhere are 400.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use slm_bus::{topic_node, TOPIC_GLOBAL};
use slm_proto::{
    short_id, Backup, BackupRestoreRequest, BackupRestoreResponse, BackupRunRequest,
    BackupRunResponse, BackupVerifyResponse, CancelResponse, CodeStatus, CodeSyncNotify,
    EventSeverity, EventSyncResponse, EventType, FleetUpdateSummary, HeartbeatRequest,
    HeartbeatResponse, Node, SyncEvent, UpdateApplyRequest, UpdateApplyResponse,
    UpdateCheckResponse, UpdateJob, UpdateJobListResponse, UpdateJobStatus, WsFrame,
};
use slm_transport::{request_span, TraceContext};
use tracing::{info, Instrument};

use crate::backups;
use crate::error::{ApiError, ApiResult};
use crate::jobs::{self, JobFilter};
use crate::registry::NodeFilter;
use crate::state::AppState;
use crate::ws;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/:node_id", get(get_node).delete(delete_node))
        .route("/api/nodes/:node_id/heartbeat", post(heartbeat))
        .route("/api/nodes/:node_id/events", get(node_events))
        .route("/api/v1/slm/events/sync", post(events_sync))
        .route("/api/code-sync/notify", post(code_sync_notify))
        .route("/updates/check", get(updates_check))
        .route("/updates/fleet-summary", get(fleet_summary))
        .route("/updates/apply", post(updates_apply))
        .route("/updates/jobs", get(list_jobs))
        .route("/updates/jobs/:job_id", get(get_job))
        .route("/updates/jobs/:job_id/cancel", post(cancel_job))
        .route("/backups/run", post(run_backup))
        .route("/backups/restore", post(restore_backup))
        .route("/backups/:backup_id/verify", get(verify_backup))
        .route("/ws/events", get(ws::ws_events))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth))
        .with_state(state)
}

// ─── Auth predicate ──────────────────────────────────────────────────────────

/// Bearer-token check. WebSocket clients that cannot set headers may pass
/// `?token=` instead. No configured token disables the check (development).
async fn auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if req.uri().path() == "/api/health" {
        return next.run(req).await;
    }
    let Some(expected) = state.config.auth_token.clone() else {
        return next.run(req).await;
    };

    let header_token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let query_token = req.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("token=").map(str::to_string))
    });

    match header_token.or(query_token) {
        None => ApiError::Unauthorized.into_response(),
        Some(token) if token == expected => next.run(req).await,
        Some(_) => ApiError::Forbidden.into_response(),
    }
}

fn trace_context(state: &AppState, headers: &HeaderMap) -> TraceContext {
    TraceContext::extract(|name| headers.get(name).and_then(|v| v.to_str().ok()))
        .map(|parent| parent.child())
        .unwrap_or_else(|| TraceContext::root(&state.sampler))
}

// ─── Health ──────────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "slm-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ─── Nodes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NodeListParams {
    code_status: Option<CodeStatus>,
}

async fn list_nodes(
    State(state): State<AppState>,
    Query(params): Query<NodeListParams>,
) -> Json<serde_json::Value> {
    let nodes = state.registry.read().list(&NodeFilter {
        code_status: params.code_status,
    });
    Json(serde_json::json!({ "total": nodes.len(), "nodes": nodes }))
}

async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<Node>> {
    state
        .registry
        .read()
        .get(&node_id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Node not found".to_string()))
}

/// Delete a node row. Jobs, backups, and events are retained — their
/// `node_id` is allowed to dangle.
async fn delete_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.registry.write().delete(&node_id) {
        return Err(ApiError::NotFound("Node not found".to_string()));
    }
    info!(node_id, "node deleted");
    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct EventListParams {
    limit: Option<usize>,
}

async fn node_events(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(params): Query<EventListParams>,
) -> Json<serde_json::Value> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    // Tolerates dangling node ids: a deleted node's history stays queryable.
    let events = state.events.read().for_node(&node_id, limit);
    Json(serde_json::json!({ "total": events.len(), "events": events }))
}

// ─── Heartbeat ingest ────────────────────────────────────────────────────────

async fn heartbeat(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> ApiResult<Json<HeartbeatResponse>> {
    // Invalid payloads are rejected before anything is touched.
    let Json(req) = payload
        .map_err(|e| ApiError::Unprocessable(format!("invalid heartbeat payload: {e}")))?;

    let ctx = trace_context(&state, &headers);
    let span = request_span("heartbeat", &ctx, Some(&node_id), None, None);
    let _guard = span.enter();

    let (node, created) = state
        .registry
        .write()
        .upsert_heartbeat(&node_id, &req, Utc::now());
    if created {
        info!(node_id, "node registered");
        state.emit_event(
            &node_id,
            EventType::NodeRegistered,
            EventSeverity::Info,
            format!("Node {node_id} registered"),
            serde_json::json!({ "hostname": node.hostname }),
        );
    }

    // Drift classification against the canonical version.
    let (code_status, latest_version) = {
        let mut drift = state.drift.write();
        if drift.is_source_node(&node_id) {
            if let Some(commit) = &req.code_version {
                drift.apply_source_heartbeat(commit);
            }
        }
        (
            drift.classify(req.code_version.as_deref()),
            drift.canonical_commit(),
        )
    };
    let transition = state.registry.write().set_code_status(&node_id, code_status);
    if let Some((old, new)) = transition {
        if new == CodeStatus::Outdated && old != CodeStatus::Outdated {
            state.emit_event(
                &node_id,
                EventType::CodeDriftDetected,
                EventSeverity::Warning,
                format!("Node {node_id} is running outdated code"),
                serde_json::json!({
                    "reported": req.code_version,
                    "canonical": latest_version,
                }),
            );
        }
    }

    let update_available = state.updates.read().has_unapplied_for(&node_id)
        || code_status == CodeStatus::Outdated;

    // Live metrics for anyone watching the node.
    let frame = WsFrame::new(
        "node_heartbeat",
        serde_json::json!({
            "node_id": node_id,
            "cpu_percent": req.cpu_percent,
            "memory_percent": req.memory_percent,
            "disk_percent": req.disk_percent,
            "code_status": code_status,
        }),
    );
    state.bus.publish(TOPIC_GLOBAL, frame.clone());
    state.bus.publish(&topic_node(&node_id), frame);

    Ok(Json(HeartbeatResponse {
        update_available,
        latest_version,
    }))
}

// ─── Agent event sync ────────────────────────────────────────────────────────

async fn events_sync(
    State(state): State<AppState>,
    payload: Result<Json<Vec<SyncEvent>>, JsonRejection>,
) -> ApiResult<Json<EventSyncResponse>> {
    let Json(events) =
        payload.map_err(|e| ApiError::Validation(format!("invalid sync payload: {e}")))?;

    let mut accepted = Vec::with_capacity(events.len());
    for event in &events {
        let node_id = event
            .data
            .get("node_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let inserted = state.events.write().ingest_synced(&node_id, event);
        if let Some(row) = inserted {
            let frame = WsFrame::new(
                "node_event",
                serde_json::to_value(&row).unwrap_or(serde_json::Value::Null),
            );
            state.bus.publish(TOPIC_GLOBAL, frame.clone());
            state.bus.publish(&topic_node(&node_id), frame);
        }
        // At-least-once delivery: replays and drops are acknowledged too, so
        // the agent can clear its buffer.
        accepted.push(event.id);
    }

    info!(count = accepted.len(), "buffered events accepted");
    Ok(Json(EventSyncResponse { accepted }))
}

// ─── Code sync ───────────────────────────────────────────────────────────────

async fn code_sync_notify(
    State(state): State<AppState>,
    payload: Result<Json<CodeSyncNotify>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(req) =
        payload.map_err(|e| ApiError::Validation(format!("invalid notify payload: {e}")))?;
    if req.commit.is_empty() {
        return Err(ApiError::Validation("commit hash required".to_string()));
    }

    state
        .drift
        .write()
        .apply_git_hook(&req.node_id, &req.commit, req.timestamp);

    // The reporting node defines "current" by definition.
    state
        .registry
        .write()
        .set_code_status(&req.node_id, CodeStatus::Current);

    info!(node_id = %req.node_id, commit = %req.commit, "canonical code version updated");
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// ─── Update planner ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UpdateCheckParams {
    node_id: Option<String>,
}

async fn updates_check(
    State(state): State<AppState>,
    Query(params): Query<UpdateCheckParams>,
) -> Json<UpdateCheckResponse> {
    let updates = state
        .updates
        .read()
        .list_unapplied(params.node_id.as_deref());
    Json(UpdateCheckResponse {
        total: updates.len(),
        updates,
    })
}

async fn fleet_summary(State(state): State<AppState>) -> Json<FleetUpdateSummary> {
    let nodes = state.registry.read().list(&NodeFilter::default());
    Json(state.updates.read().fleet_summary(&nodes))
}

// ─── Job engine ──────────────────────────────────────────────────────────────

async fn updates_apply(
    State(state): State<AppState>,
    payload: Result<Json<UpdateApplyRequest>, JsonRejection>,
) -> ApiResult<Json<UpdateApplyResponse>> {
    let Json(req) =
        payload.map_err(|e| ApiError::Validation(format!("invalid apply payload: {e}")))?;
    if req.update_ids.is_empty() {
        return Err(ApiError::Validation("no valid updates".to_string()));
    }
    if state.registry.read().get(&req.node_id).is_none() {
        return Err(ApiError::NotFound("Node not found".to_string()));
    }
    let updates = state.updates.read().get_many(&req.update_ids);
    if updates.is_empty() {
        return Err(ApiError::NotFound("No valid updates found".to_string()));
    }

    let job_id = short_id();
    let job = UpdateJob::new(job_id.clone(), req.node_id.clone(), req.update_ids.clone());
    state.jobs.write().insert(job);

    state.emit_event(
        &req.node_id,
        EventType::DeploymentStarted,
        EventSeverity::Info,
        format!("Update job started: {} package(s)", updates.len()),
        serde_json::json!({ "job_id": job_id, "update_ids": req.update_ids }),
    );

    jobs::start_job(&state, job_id.clone());
    info!(job_id, node_id = %req.node_id, updates = updates.len(), "update job created");

    Ok(Json(UpdateApplyResponse {
        success: true,
        message: format!("Update job started for {} package(s)", updates.len()),
        job_id: Some(job_id),
    }))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<UpdateJob>> {
    state
        .jobs
        .read()
        .get(&job_id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Update job not found".to_string()))
}

#[derive(Debug, Deserialize)]
struct JobListParams {
    node_id: Option<String>,
    status: Option<UpdateJobStatus>,
    limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobListParams>,
) -> Json<UpdateJobListResponse> {
    let filter = JobFilter {
        node_id: params.node_id,
        status: params.status,
        limit: params.limit.unwrap_or(20).clamp(1, 100),
    };
    let jobs = state.jobs.read().list(&filter);
    Json(UpdateJobListResponse {
        total: jobs.len(),
        jobs,
    })
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<CancelResponse>> {
    let ctx = trace_context(&state, &headers);
    let span = request_span("cancel_job", &ctx, None, Some(&job_id), None);
    let _guard = span.enter();

    let job = state
        .jobs
        .read()
        .get(&job_id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound("Update job not found".to_string()))?;

    if !job.status.can_cancel() {
        return Err(ApiError::Conflict(format!(
            "Cannot cancel job in status: {}",
            job.status
        )));
    }

    // Cooperative: the background task sees the flag at its next step
    // boundary; the terminal write here wins either way.
    jobs::signal_cancel(&state, &job_id);
    state.jobs.write().update_active(&job_id, |job| {
        job.status = UpdateJobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
    });

    info!(job_id, "update job cancelled");
    Ok(Json(CancelResponse {
        success: true,
        message: "Job cancelled".to_string(),
    }))
}

// ─── Backups ─────────────────────────────────────────────────────────────────

async fn run_backup(
    State(state): State<AppState>,
    payload: Result<Json<BackupRunRequest>, JsonRejection>,
) -> ApiResult<Json<BackupRunResponse>> {
    let Json(req) =
        payload.map_err(|e| ApiError::Validation(format!("invalid backup request: {e}")))?;
    if req.service.is_empty() {
        return Err(ApiError::Validation("service required".to_string()));
    }
    if state.registry.read().get(&req.node_id).is_none() {
        return Err(ApiError::NotFound("Node not found".to_string()));
    }

    let backup_id = short_id();
    let backup = Backup::new(backup_id.clone(), req.node_id.clone(), req.service.clone());
    state.backups.write().insert(backup);

    backups::start_backup(&state, backup_id.clone());
    info!(backup_id, node_id = %req.node_id, service = %req.service, "backup started");

    Ok(Json(BackupRunResponse { backup_id }))
}

async fn restore_backup(
    State(state): State<AppState>,
    payload: Result<Json<BackupRestoreRequest>, JsonRejection>,
) -> ApiResult<Json<BackupRestoreResponse>> {
    let Json(req) =
        payload.map_err(|e| ApiError::Validation(format!("invalid restore request: {e}")))?;
    let response = backups::run_restore(&state, &req.backup_id, &req.target_node_id).await?;
    Ok(Json(response))
}

async fn verify_backup(
    State(state): State<AppState>,
    Path(backup_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<BackupVerifyResponse>> {
    let ctx = trace_context(&state, &headers);
    let span = request_span("verify_backup", &ctx, None, None, Some(&backup_id));
    let response = backups::verify_backup(&state, &backup_id)
        .instrument(span)
        .await?;
    Ok(Json(response))
}
