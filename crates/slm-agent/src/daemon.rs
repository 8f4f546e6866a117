//! The agent daemon: heartbeat loop, buffered-event sync, update flagging.
//!
//! One cooperative task group: the heartbeat loop here, the notify server
//! (code-source nodes), and the signal handler in `main`. A heartbeat send
//! is bounded so a stalled controller can never delay the next beat past
//! its interval.

use chrono::Utc;
use slm_proto::{
    CodeChangeRequest, CodeSyncNotify, CodeVersionSource, EventSyncResponse, HeartbeatResponse,
    SyncEvent,
};
use slm_transport::{build_client, send_with_retry, ClientOptions, RetryPolicy, Sampler, TraceContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::buffer::EventBuffer;
use crate::config::AgentConfig;
use crate::error::AgentResult;
use crate::health::HealthCollector;
use crate::version::VersionManager;
use crate::watchdog;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Max buffered events offered per sync call.
const SYNC_BATCH: usize = 100;

/// A heartbeat send must return this long before the next beat is due.
const SEND_SAFETY_MARGIN: Duration = Duration::from_secs(5);

/// Floor on the heartbeat send budget.
const MIN_SEND_BUDGET: Duration = Duration::from_secs(10);

pub struct SlmAgent {
    config: AgentConfig,
    buffer: EventBuffer,
    collector: HealthCollector,
    version: VersionManager,
    client: reqwest::Client,
    bulk_client: reqwest::Client,
    sampler: Sampler,
    running: AtomicBool,
    shutdown: Notify,
    pending_update: AtomicBool,
    latest_version: parking_lot::Mutex<Option<String>>,
}

impl SlmAgent {
    pub fn new(config: AgentConfig) -> AgentResult<Self> {
        let buffer = EventBuffer::open(&config.buffer_db)?;
        let collector = HealthCollector::new(config.services.clone());
        let version = VersionManager::new(&config.state_dir());
        let client = build_client(ClientOptions::heartbeat(config.insecure))?;
        let bulk_client = build_client(ClientOptions::bulk(config.insecure))?;

        Ok(Self {
            config,
            buffer,
            collector,
            version,
            client,
            bulk_client,
            sampler: Sampler::default(),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            pending_update: AtomicBool::new(false),
            latest_version: parking_lot::Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn has_pending_update(&self) -> bool {
        self.pending_update.load(Ordering::Relaxed)
    }

    pub fn current_commit(&self) -> Option<String> {
        self.version.current_commit()
    }

    /// Request a clean shutdown; the loop finishes its current cycle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Main agent loop. Returns once [`stop`](Self::stop) is observed.
    pub async fn run(self: Arc<Self>) -> AgentResult<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            node_id = %self.config.node_id,
            admin = %self.config.admin_url,
            interval = self.config.heartbeat_interval_secs,
            "agent started"
        );
        watchdog::sd_notify(watchdog::READY);

        if self.config.code_source {
            let agent = Arc::clone(&self);
            let port = self.config.notify_port;
            tokio::spawn(async move {
                if let Err(e) = crate::notify::serve(agent, port).await {
                    warn!(error = %e, "notify server exited");
                }
            });
        }

        let interval = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        while self.running.load(Ordering::SeqCst) {
            watchdog::sd_notify(watchdog::WATCHDOG);

            let ok = self.send_heartbeat().await;
            if ok {
                self.sync_buffered_events().await;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.notified() => break,
            }
        }

        watchdog::sd_notify(watchdog::STOPPING);
        info!(node_id = %self.config.node_id, "agent stopped");
        Ok(())
    }

    fn send_budget(&self) -> Duration {
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs);
        interval
            .saturating_sub(SEND_SAFETY_MARGIN)
            .max(MIN_SEND_BUDGET)
    }

    /// Send one heartbeat. On transport failure the payload is buffered as a
    /// heartbeat event; controller-side rejections are logged but not
    /// buffered (a bad payload would only be rejected again).
    pub async fn send_heartbeat(&self) -> bool {
        let sample = self.collector.collect().await;
        let payload = sample.into_heartbeat(AGENT_VERSION, self.version.current_commit());
        let url = format!(
            "{}/api/nodes/{}/heartbeat",
            self.config.admin_base(),
            self.config.node_id
        );

        let ctx = TraceContext::root(&self.sampler);
        let request = ctx.inject(self.client.post(&url).json(&payload));

        match timeout(self.send_budget(), request.send()).await {
            Ok(Ok(resp)) if resp.status().is_success() => {
                match resp.json::<HeartbeatResponse>().await {
                    Ok(body) => self.handle_heartbeat_response(body),
                    Err(e) => debug!(error = %e, "unreadable heartbeat response"),
                }
                debug!("heartbeat sent");
                true
            }
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                if status >= 500 {
                    warn!(status, "heartbeat failed upstream, buffering");
                    self.buffer_heartbeat(&payload);
                } else {
                    warn!(status, "heartbeat rejected");
                }
                false
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to send heartbeat, buffering");
                self.buffer_heartbeat(&payload);
                false
            }
            Err(_) => {
                // Budget exhausted: abandon this send (dropping the future
                // cancels the request) and let the next beat proceed.
                warn!(budget_secs = self.send_budget().as_secs(), "heartbeat timed out, buffering");
                self.buffer_heartbeat(&payload);
                false
            }
        }
    }

    fn buffer_heartbeat(&self, payload: &slm_proto::HeartbeatRequest) {
        let mut data = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        // Stamp the node id so the controller can attribute the event once
        // it finally arrives via sync.
        if let Some(map) = data.as_object_mut() {
            map.insert(
                "node_id".to_string(),
                serde_json::Value::String(self.config.node_id.clone()),
            );
        }
        self.buffer.append("heartbeat", &data);
    }

    fn handle_heartbeat_response(&self, resp: HeartbeatResponse) {
        if resp.update_available {
            let latest = resp.latest_version.clone().unwrap_or_else(|| "unknown".into());
            let current = self.version.current_commit().unwrap_or_else(|| "unknown".into());
            info!(
                current = %truncate(&current, 12),
                latest = %truncate(&latest, 12),
                "update available"
            );
            self.pending_update.store(true, Ordering::Relaxed);
            *self.latest_version.lock() = resp.latest_version;
        }
    }

    /// Drain buffered events to the controller in id order, one batch per
    /// cycle. Only ids the controller acknowledged are marked synced.
    pub async fn sync_buffered_events(&self) {
        let events = self.buffer.pending(SYNC_BATCH);
        if events.is_empty() {
            return;
        }
        info!(count = events.len(), "syncing buffered events");

        let payload: Vec<SyncEvent> = events
            .iter()
            .map(|e| SyncEvent {
                id: e.id,
                event_type: e.event_type.clone(),
                data: e.data.clone(),
            })
            .collect();

        let url = format!("{}/api/v1/slm/events/sync", self.config.admin_base());
        let ctx = TraceContext::root(&self.sampler);
        let request = ctx.inject(self.bulk_client.post(&url).json(&payload));

        match send_with_retry(request, &RetryPolicy::default()).await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<EventSyncResponse>().await {
                    Ok(body) => {
                        self.buffer.mark_synced(&body.accepted);
                        info!(accepted = body.accepted.len(), "events synced");
                    }
                    Err(e) => warn!(error = %e, "unreadable sync response"),
                }
            }
            Ok(resp) => warn!(status = resp.status().as_u16(), "event sync rejected"),
            Err(e) => warn!(error = %e, "failed to sync events"),
        }
    }

    /// Handle a code-change notification from the local git hook: persist the
    /// new version, buffer the event, and fire an out-of-band notify to the
    /// controller. The buffered event covers the notify failing.
    pub fn handle_code_change(self: &Arc<Self>, req: &CodeChangeRequest) -> AgentResult<()> {
        info!(
            commit = %truncate(&req.commit, 12),
            branch = req.branch.as_deref().unwrap_or("unknown"),
            "code change notification"
        );

        self.version.save(
            &req.commit,
            req.branch.clone(),
            req.message.clone(),
            CodeVersionSource::GitHook,
        )?;

        self.buffer.append(
            "code_change",
            &serde_json::json!({
                "commit": req.commit,
                "branch": req.branch,
                "message": req.message.as_deref().map(|m| truncate(m, 200)),
                "node_id": self.config.node_id,
            }),
        );

        let agent = Arc::clone(self);
        let commit = req.commit.clone();
        tokio::spawn(async move {
            agent.notify_code_sync(&commit).await;
        });
        Ok(())
    }

    async fn notify_code_sync(&self, commit: &str) {
        let url = format!("{}/api/code-sync/notify", self.config.admin_base());
        let payload = CodeSyncNotify {
            node_id: self.config.node_id.clone(),
            commit: commit.to_string(),
            is_code_source: true,
            timestamp: Some(Utc::now()),
        };
        let ctx = TraceContext::root(&self.sampler);
        let request = ctx.inject(self.client.post(&url).json(&payload));

        match timeout(Duration::from_secs(10), request.send()).await {
            Ok(Ok(resp)) if resp.status().is_success() => {
                info!(commit = %truncate(commit, 12), "controller notified of code change");
            }
            Ok(Ok(resp)) => {
                warn!(status = resp.status().as_u16(), "code-sync notify rejected");
            }
            Ok(Err(e)) => warn!(error = %e, "code-sync notify failed"),
            Err(_) => warn!("code-sync notify timed out"),
        }
        // Already buffered as a code_change event; it syncs with the next
        // successful heartbeat either way.
    }

    #[cfg(test)]
    pub fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
