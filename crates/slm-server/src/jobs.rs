//! Update job store and background engine.
//!
//! Jobs are created `pending`, dispatched to a background task, and polled or
//! watched over the bus. All mutation of one job row funnels through the
//! store under a single writer; a cancel written by the API always wins over
//! the background task's writes (the task only appends output after that).

use chrono::Utc;
use slm_persist::SnapshotStore;
use slm_proto::{
    step_progress, EventSeverity, EventType, UpdateJob, UpdateJobStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::state::AppState;

/// Remote package installs get this long before the step is failed.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Only the last N output lines are retained on the job row.
const OUTPUT_TAIL: usize = 100;

// ─── Store ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub node_id: Option<String>,
    pub status: Option<UpdateJobStatus>,
    pub limit: usize,
}

pub struct JobStore {
    rows: HashMap<String, UpdateJob>,
    store: SnapshotStore,
}

impl JobStore {
    pub fn new(state_dir: &std::path::Path) -> Self {
        let store = SnapshotStore::new(state_dir, "update_jobs");
        let rows = store.load();
        Self { rows, store }
    }

    pub fn insert(&mut self, job: UpdateJob) {
        self.rows.insert(job.job_id.clone(), job);
        self.snapshot();
    }

    pub fn get(&self, job_id: &str) -> Option<&UpdateJob> {
        self.rows.get(job_id)
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<UpdateJob> {
        let mut jobs: Vec<UpdateJob> = self
            .rows
            .values()
            .filter(|j| filter.node_id.as_deref().is_none_or(|id| j.node_id == id))
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if filter.limit > 0 {
            jobs.truncate(filter.limit);
        }
        jobs
    }

    /// Unconditional mutation — used only for output appends, which are
    /// retained even after a cancel has made the row terminal.
    pub fn update_row(
        &mut self,
        job_id: &str,
        f: impl FnOnce(&mut UpdateJob),
    ) -> Option<UpdateJob> {
        let job = self.rows.get_mut(job_id)?;
        f(job);
        let job = job.clone();
        self.snapshot();
        Some(job)
    }

    /// Mutation that respects terminal states: once a row is completed,
    /// failed, or cancelled, nothing may change its status or progress.
    pub fn update_active(
        &mut self,
        job_id: &str,
        f: impl FnOnce(&mut UpdateJob),
    ) -> Option<UpdateJob> {
        let job = self.rows.get_mut(job_id)?;
        if job.status.is_terminal() {
            return None;
        }
        f(job);
        let job = job.clone();
        self.snapshot();
        Some(job)
    }

    /// Fail every job left `pending`/`running` by a previous controller
    /// process. There is no cross-restart recovery; a terminal failure with
    /// an explicit error is the safe default.
    pub fn sweep_orphans(&mut self) -> usize {
        let now = Utc::now();
        let mut swept = 0;
        for job in self.rows.values_mut() {
            if !job.status.is_terminal() {
                job.status = UpdateJobStatus::Failed;
                job.error = Some("controller restarted".to_string());
                job.completed_at = Some(now);
                swept += 1;
            }
        }
        if swept > 0 {
            self.snapshot();
        }
        swept
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.rows) {
            warn!(error = %e, "failed to snapshot job store");
        }
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

fn install_command(package: &str) -> String {
    format!("sudo DEBIAN_FRONTEND=noninteractive apt-get install -y {package}")
}

fn tail(lines: &[String]) -> String {
    let start = lines.len().saturating_sub(OUTPUT_TAIL);
    lines[start..].join("\n")
}

/// Register the cancel flag and dispatch the background task for a job the
/// API just created.
pub fn start_job(state: &AppState, job_id: String) {
    let flag = Arc::new(AtomicBool::new(false));
    state.running_jobs.lock().insert(job_id.clone(), flag);

    let state = state.clone();
    tokio::spawn(async move {
        run_update_job(state, job_id).await;
    });
}

/// Request cooperative cancellation. The caller has already validated the
/// transition; the running install (if any) finishes its subprocess but its
/// result is discarded.
pub fn signal_cancel(state: &AppState, job_id: &str) {
    if let Some(flag) = state.running_jobs.lock().get(job_id) {
        flag.store(true, Ordering::SeqCst);
    }
}

fn fail_before_start(state: &AppState, job_id: &str, error: &str) {
    warn!(job_id, error, "update job failed validation");
    state.jobs.write().update_active(job_id, |job| {
        job.status = UpdateJobStatus::Failed;
        job.error = Some(error.to_string());
        job.completed_at = Some(Utc::now());
    });
}

async fn run_update_job(state: AppState, job_id: String) {
    let cancel = state
        .running_jobs
        .lock()
        .get(&job_id)
        .cloned()
        .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

    let outcome = execute_job(&state, &job_id, &cancel).await;
    state.running_jobs.lock().remove(&job_id);

    if let Some((node_id, applied, failed, total)) = outcome {
        let (event_type, severity) = if failed == 0 {
            (EventType::DeploymentCompleted, EventSeverity::Info)
        } else {
            (EventType::DeploymentFailed, EventSeverity::Warning)
        };
        state.emit_event(
            &node_id,
            event_type,
            severity,
            format!("Update job {job_id} completed: {applied}/{total} applied"),
            serde_json::json!({ "job_id": job_id, "applied": applied, "failed": failed }),
        );
    }
}

/// Drive the job to a terminal state. Returns `(node_id, applied, failed,
/// total)` when the run finished on its own (not cancelled, not rejected
/// before start).
async fn execute_job(
    state: &AppState,
    job_id: &str,
    cancel: &AtomicBool,
) -> Option<(String, usize, usize, usize)> {
    let Some(job) = state.jobs.read().get(job_id).cloned() else {
        warn!(job_id, "update job not found");
        return None;
    };
    if job.status.is_terminal() {
        return None;
    }

    let node = state.registry.read().get(&job.node_id).cloned();
    let Some(node) = node else {
        fail_before_start(state, job_id, "Node not found");
        return None;
    };

    let updates = state.updates.read().get_many(&job.update_ids);
    if updates.is_empty() {
        fail_before_start(state, job_id, "No valid updates found");
        return None;
    }

    let total = updates.len();
    state.jobs.write().update_active(job_id, |job| {
        job.status = UpdateJobStatus::Running;
        job.started_at = Some(Utc::now());
        job.total_steps = total;
    });
    state.publish_job_progress(job_id, "running", 0, Some("Starting update process..."));

    let runner = state.runner_for_node(&node);
    let mut output_lines: Vec<String> = Vec::new();
    let mut applied = 0usize;
    let mut failed = 0usize;
    let mut last_progress = 0u8;

    for update in &updates {
        if cancel.load(Ordering::SeqCst) {
            finalize_cancelled(state, job_id, last_progress);
            return None;
        }

        let step = format!(
            "Installing {} ({})",
            update.package_name, update.available_version
        );
        last_progress = step_progress(applied + failed, total);
        state.jobs.write().update_active(job_id, |job| {
            job.current_step = Some(step.clone());
            job.progress = last_progress;
        });
        state.publish_job_progress(job_id, "running", last_progress, Some(&step));

        let result = runner
            .run(&install_command(&update.package_name), INSTALL_TIMEOUT)
            .await;

        let observed_cancel = cancel.load(Ordering::SeqCst);
        match result {
            Ok(out) => {
                output_lines.extend(out.combined().lines().map(String::from));
                if observed_cancel {
                    // Subprocess finished but the result is discarded.
                    append_output(state, job_id, &output_lines);
                    finalize_cancelled(state, job_id, last_progress);
                    return None;
                }
                if out.success() {
                    state.updates.write().mark_applied(&update.update_id);
                    applied += 1;
                    let applied_now = applied;
                    state.jobs.write().update_active(job_id, |job| {
                        job.completed_steps = applied_now;
                    });
                    info!(job_id, package = %update.package_name, "package installed");
                } else {
                    failed += 1;
                    warn!(
                        job_id,
                        package = %update.package_name,
                        exit_code = out.exit_code,
                        "package install failed"
                    );
                }
            }
            Err(e) => {
                output_lines.push(format!("ERROR: {e}"));
                if observed_cancel {
                    append_output(state, job_id, &output_lines);
                    finalize_cancelled(state, job_id, last_progress);
                    return None;
                }
                failed += 1;
                warn!(job_id, package = %update.package_name, error = %e, "package install errored");
            }
        }
        append_output(state, job_id, &output_lines);
    }

    let status = if failed == 0 {
        UpdateJobStatus::Completed
    } else {
        UpdateJobStatus::Failed
    };
    let finalized = state
        .jobs
        .write()
        .update_active(job_id, |job| {
            job.status = status;
            if failed > 0 {
                job.error = Some(format!("Failed to install {failed} package(s)"));
            }
            job.progress = 100;
            job.current_step = Some("Completed".to_string());
            job.completed_at = Some(Utc::now());
        })
        .is_some();
    if !finalized {
        // A cancel landed between the last install and this write; the
        // cancelled row stands.
        return None;
    }
    state.publish_job_progress(
        job_id,
        &status.to_string(),
        100,
        Some(&format!("Completed: {applied}/{total} updates applied")),
    );

    Some((node.node_id, applied, failed, total))
}

fn append_output(state: &AppState, job_id: &str, lines: &[String]) {
    let text = tail(lines);
    state.jobs.write().update_row(job_id, |job| {
        job.output = Some(text);
    });
}

fn finalize_cancelled(state: &AppState, job_id: &str, progress: u8) {
    // The cancel endpoint usually wrote the terminal row already; this only
    // lands when the task observed the flag first.
    state.jobs.write().update_active(job_id, |job| {
        job.status = UpdateJobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
    });
    state.publish_job_progress(job_id, "cancelled", progress, Some("Job cancelled"));
    info!(job_id, "update job cancelled");
}
