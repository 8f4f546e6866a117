//! Node health sampling.
//!
//! Collects CPU / memory / disk usage, load averages, uptime, hostname, and
//! systemd service states into a flat sample suitable for the heartbeat
//! payload. Platforms missing a probe report `None` for that field — a
//! partial sample is still a valid heartbeat.

use parking_lot::Mutex;
use slm_proto::{HeartbeatExtra, HeartbeatRequest};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::process::Command;
use tracing::debug;

/// Sampling interval between the two CPU refreshes a usage reading needs.
const CPU_SAMPLE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct HealthSample {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub load_avg: Vec<f64>,
    pub uptime_seconds: Option<u64>,
    pub hostname: Option<String>,
    pub os_info: Option<String>,
    pub services: HashMap<String, String>,
    pub discovered_services: Vec<String>,
}

impl HealthSample {
    /// Shape the sample into a heartbeat request.
    pub fn into_heartbeat(
        self,
        agent_version: &str,
        code_version: Option<String>,
    ) -> HeartbeatRequest {
        HeartbeatRequest {
            cpu_percent: self.cpu_percent,
            memory_percent: self.memory_percent,
            disk_percent: self.disk_percent,
            agent_version: Some(agent_version.to_string()),
            os_info: self.os_info,
            code_version,
            extra_data: HeartbeatExtra {
                services: self.services,
                discovered_services: self.discovered_services,
                load_avg: self.load_avg,
                uptime_seconds: self.uptime_seconds,
                hostname: self.hostname,
            },
        }
    }
}

pub struct HealthCollector {
    services: Vec<String>,
    sys: Mutex<System>,
}

impl HealthCollector {
    pub fn new(services: Vec<String>) -> Self {
        Self {
            services,
            sys: Mutex::new(System::new()),
        }
    }

    /// Take a full sample. Never fails; missing probes yield `None` fields.
    pub async fn collect(&self) -> HealthSample {
        let mut sample = HealthSample::default();

        self.sample_cpu(&mut sample).await;
        self.sample_memory(&mut sample);
        sample.disk_percent = root_disk_percent();

        let load = System::load_average();
        sample.load_avg = vec![load.one, load.five, load.fifteen];
        sample.uptime_seconds = Some(System::uptime());
        sample.hostname = hostname::get().ok().map(|h| h.to_string_lossy().to_string());
        sample.os_info = os_info();

        for service in &self.services {
            let state = service_state(service).await;
            sample.services.insert(service.clone(), state);
        }
        sample.discovered_services = discover_running_services().await;

        debug!(
            cpu = ?sample.cpu_percent,
            mem = ?sample.memory_percent,
            disk = ?sample.disk_percent,
            services = sample.services.len(),
            "health sample collected"
        );
        sample
    }

    async fn sample_cpu(&self, sample: &mut HealthSample) {
        // Two refreshes a short interval apart; the first primes the counters.
        self.sys.lock().refresh_cpu_usage();
        tokio::time::sleep(CPU_SAMPLE_DELAY).await;
        let mut sys = self.sys.lock();
        sys.refresh_cpu_usage();
        let usage = sys.global_cpu_usage();
        if usage.is_finite() {
            sample.cpu_percent = Some(f64::from(usage));
        }
    }

    fn sample_memory(&self, sample: &mut HealthSample) {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total > 0 {
            sample.memory_percent = Some(sys.used_memory() as f64 / total as f64 * 100.0);
        }
    }
}

fn root_disk_percent() -> Option<f64> {
    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))?;
    let total = root.total_space();
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(root.available_space());
    Some(used as f64 / total as f64 * 100.0)
}

fn os_info() -> Option<String> {
    match (System::name(), System::os_version()) {
        (Some(name), Some(version)) => Some(format!("{name} {version}")),
        (Some(name), None) => Some(name),
        _ => None,
    }
}

/// `systemctl is-active <unit>` — "active", "inactive", "failed", or
/// "unknown" when systemd is unavailable.
async fn service_state(service: &str) -> String {
    let result = Command::new("systemctl")
        .arg("is-active")
        .arg(service)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    match result {
        Ok(out) => {
            let state = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if state.is_empty() {
                "unknown".to_string()
            } else {
                state
            }
        }
        Err(_) => "unknown".to_string(),
    }
}

/// Running service units, for the auto-discovered list. Empty when systemd
/// is unavailable.
async fn discover_running_services() -> Vec<String> {
    let result = Command::new("systemctl")
        .args([
            "list-units",
            "--type=service",
            "--state=running",
            "--no-legend",
            "--plain",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    let Ok(out) = result else {
        return Vec::new();
    };
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(|unit| unit.trim_end_matches(".service").to_string())
        .collect()
}
