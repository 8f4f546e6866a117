//! slm-proto — Shared types for the SLM fleet lifecycle manager
//!
//! Defines all payloads exchanged between the node agents and the controller,
//! plus the controller's persisted row types: nodes, node events, update info,
//! update jobs, backups, and code versions. Everything is serde-serializable;
//! enums use snake_case on the wire.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Generate a short opaque identifier (16 hex chars of a v4 UUID).
///
/// Used for job, event, and backup ids so they stay readable in logs and URLs.
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

// ─── Code status / versions ──────────────────────────────────────────────────

/// How a node's reported commit compares to the canonical code version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeStatus {
    Current,
    Outdated,
    #[default]
    Unknown,
}

impl std::fmt::Display for CodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Current => "current",
            Self::Outdated => "outdated",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodeVersionSource {
    GitHook,
    Heartbeat,
}

/// A commit observed from the code-source node. The latest one the controller
/// holds is canonical; every other node is compared against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeVersion {
    pub commit_hash: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub source: CodeVersionSource,
    pub observed_at: DateTime<Utc>,
}

// ─── Heartbeat ───────────────────────────────────────────────────────────────

/// Extra payload carried inside a heartbeat. All fields optional: a collector
/// missing instrumentation on some platform reports nulls, never an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatExtra {
    #[serde(default)]
    pub services: HashMap<String, String>,
    #[serde(default)]
    pub discovered_services: Vec<String>,
    #[serde(default)]
    pub load_avg: Vec<f64>,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub memory_percent: Option<f64>,
    #[serde(default)]
    pub disk_percent: Option<f64>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub os_info: Option<String>,
    #[serde(default)]
    pub code_version: Option<String>,
    #[serde(default)]
    pub extra_data: HeartbeatExtra,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub update_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
}

// ─── Nodes ───────────────────────────────────────────────────────────────────

/// A managed node as the controller tracks it. Created on first heartbeat
/// (JIT registration) or by explicit provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub os_info: Option<String>,
    #[serde(default)]
    pub code_version: Option<String>,
    #[serde(default)]
    pub code_status: CodeStatus,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub memory_percent: Option<f64>,
    #[serde(default)]
    pub disk_percent: Option<f64>,
    #[serde(default)]
    pub extra_data: serde_json::Value,
}

impl Node {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: None,
            ip_address: None,
            ssh_user: None,
            ssh_port: None,
            agent_version: None,
            os_info: None,
            code_version: None,
            code_status: CodeStatus::Unknown,
            last_seen: None,
            cpu_percent: None,
            memory_percent: None,
            disk_percent: None,
            extra_data: serde_json::Value::Null,
        }
    }
}

// ─── Node events ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Heartbeat,
    CodeChange,
    NodeRegistered,
    CodeDriftDetected,
    DeploymentStarted,
    DeploymentCompleted,
    DeploymentFailed,
    BackupStarted,
    BackupCompleted,
    BackupFailed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            serde_json::to_value(self)
                .unwrap_or_default()
                .as_str()
                .unwrap_or("unknown")
        )
    }
}

/// Append-only event record; the source of truth for the broadcaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub event_id: String,
    pub node_id: String,
    pub event_type: EventType,
    pub severity: EventSeverity,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ─── Agent event sync ────────────────────────────────────────────────────────

/// One buffered agent event offered during `/api/v1/slm/events/sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSyncResponse {
    pub accepted: Vec<i64>,
}

// ─── Code sync ───────────────────────────────────────────────────────────────

/// Out-of-band notification from the code-source node's git hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSyncNotify {
    pub node_id: String,
    pub commit: String,
    #[serde(default)]
    pub is_code_source: bool,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChangeRequest {
    pub commit: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChangeResponse {
    pub status: String,
    pub commit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthResponse {
    pub status: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

// ─── Updates ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSeverity {
    Low,
    #[default]
    Moderate,
    Important,
    Critical,
}

/// An available package update. `node_id = None` means fleet-global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub update_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub package_name: String,
    #[serde(default)]
    pub current_version: Option<String>,
    pub available_version: String,
    #[serde(default)]
    pub severity: UpdateSeverity,
    #[serde(default)]
    pub is_applied: bool,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UpdateInfo {
    /// Mark applied, stamping `applied_at` so the pair stays consistent.
    pub fn mark_applied(&mut self, at: DateTime<Utc>) {
        self.is_applied = true;
        self.applied_at = Some(at);
    }

    /// Whether this update applies to the given node (own row or global).
    pub fn applies_to(&self, node_id: &str) -> bool {
        match &self.node_id {
            Some(id) => id == node_id,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCheckResponse {
    pub updates: Vec<UpdateInfo>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUpdateSummary {
    pub node_id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    pub system_updates: usize,
    pub code_update_available: bool,
    pub code_status: CodeStatus,
    pub total_updates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetUpdateSummary {
    pub nodes: Vec<NodeUpdateSummary>,
    pub total_system_updates: usize,
    pub total_code_updates: usize,
    pub nodes_needing_updates: usize,
}

// ─── Update jobs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl UpdateJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Cancellation is only legal before the job reaches a terminal state.
    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for UpdateJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJob {
    pub job_id: String,
    pub node_id: String,
    pub status: UpdateJobStatus,
    pub update_ids: Vec<String>,
    #[serde(default)]
    pub total_steps: usize,
    #[serde(default)]
    pub completed_steps: usize,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl UpdateJob {
    pub fn new(job_id: String, node_id: String, update_ids: Vec<String>) -> Self {
        Self {
            job_id,
            node_id,
            status: UpdateJobStatus::Pending,
            total_steps: update_ids.len(),
            update_ids,
            completed_steps: 0,
            progress: 0,
            current_step: None,
            output: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Progress for a job step boundary: floor(completed/total * 100).
pub fn step_progress(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((completed * 100) / total).min(100) as u8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateApplyRequest {
    pub node_id: String,
    pub update_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateApplyResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJobListResponse {
    pub jobs: Vec<UpdateJob>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
    pub message: String,
}

// ─── Backups ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub backup_id: String,
    pub node_id: String,
    pub service: String,
    pub status: BackupStatus,
    #[serde(default)]
    pub backup_path: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// SHA-256 hex of the artefact (local copy when present, else remote).
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub extra_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Backup {
    pub fn new(backup_id: String, node_id: String, service: String) -> Self {
        Self {
            backup_id,
            node_id,
            service,
            status: BackupStatus::Pending,
            backup_path: None,
            size_bytes: None,
            checksum: None,
            extra_data: serde_json::Value::Null,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRunRequest {
    pub node_id: String,
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRunResponse {
    pub backup_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRestoreRequest {
    pub backup_id: String,
    pub target_node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRestoreResponse {
    pub success: bool,
    pub message: String,
}

/// Result of the on-demand integrity check. Fields are populated per outcome:
/// a clean pass carries `checksum`, a mismatch carries the expected/actual
/// pair, a missing artefact carries only `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupVerifyResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── WebSocket frames ────────────────────────────────────────────────────────

/// A frame forwarded to WebSocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl WsFrame {
    pub fn new(frame_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}
