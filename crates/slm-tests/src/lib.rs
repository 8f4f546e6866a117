//! Shared fixtures for the SLM integration tests.
//!
//! Provides a scripted [`CommandRunner`] standing in for SSH, plus helpers
//! to build a controller on tempdir state and serve it on an ephemeral port.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use slm_exec::{CommandOutput, CommandRunner, ExecError, ExecResult, RunnerFactory};
use slm_server::{router, AppState, ServerConfig};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn failed(stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: 1,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// Behavior of one scripted package install.
pub enum InstallStep {
    /// Succeed immediately with this output.
    Ok(&'static str),
    /// Fail immediately with this output.
    Fail(&'static str),
    /// Block on the gate, then succeed with this output.
    OkGated(Arc<Semaphore>, &'static str),
}

/// A scripted command endpoint. Knows the Redis-flavored commands the
/// backup executor issues and pops [`InstallStep`]s for package installs.
pub struct FakeRunner {
    installs: Mutex<VecDeque<InstallStep>>,
    lastsave_reads: AtomicI64,
    snapshot: Vec<u8>,
    fail_copy: bool,
    log: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            installs: Mutex::new(VecDeque::new()),
            lastsave_reads: AtomicI64::new(0),
            snapshot: b"fake-rdb-snapshot-payload".to_vec(),
            fail_copy: false,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_installs(steps: Vec<InstallStep>) -> Self {
        let runner = Self::new();
        *runner.installs.lock() = steps.into();
        runner
    }

    pub fn with_failing_copy() -> Self {
        let mut runner = Self::new();
        runner.fail_copy = true;
        runner
    }

    pub fn snapshot_checksum(&self) -> String {
        hex::encode(Sha256::digest(&self.snapshot))
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    fn describe(&self) -> String {
        "fake".to_string()
    }

    async fn run(&self, command: &str, _timeout: Duration) -> ExecResult<CommandOutput> {
        self.log.lock().push(command.to_string());

        if command.contains("apt-get install") {
            let step = self.installs.lock().pop_front();
            return Ok(match step {
                Some(InstallStep::Ok(out)) => ok(out),
                Some(InstallStep::Fail(out)) => failed(out),
                Some(InstallStep::OkGated(gate, out)) => {
                    let _permit = gate.acquire().await.map_err(|_| {
                        ExecError::Timeout(Duration::from_secs(0))
                    })?;
                    ok(out)
                }
                None => failed("no scripted install step"),
            });
        }
        if command.contains("requirepass") {
            return Ok(ok(""));
        }
        if command.contains("CONFIG GET") {
            return Ok(ok("dir\n/var/lib/redis\ndbfilename\ndump.rdb\n"));
        }
        if command.contains("LASTSAVE") {
            // The pre-snapshot read returns the old timestamp; every read
            // after BGSAVE sees it advanced.
            let reads = self.lastsave_reads.fetch_add(1, Ordering::SeqCst);
            return Ok(ok(if reads == 0 { "100" } else { "101" }));
        }
        if command.contains("BGSAVE") {
            return Ok(ok("Background saving started"));
        }
        if command.contains("stat -c") {
            return Ok(ok(self.snapshot.len().to_string()));
        }
        if command.contains("sha256sum") {
            return Ok(ok(self.snapshot_checksum()));
        }
        if command.contains("PING") {
            return Ok(ok("PONG\n42"));
        }
        // systemctl stop/start, mv, chown, test -f
        Ok(ok("exists"))
    }

    async fn copy_from(
        &self,
        _remote_path: &str,
        local_path: &Path,
        _timeout: Duration,
    ) -> ExecResult<()> {
        if self.fail_copy {
            return Err(ExecError::Copy("scp: connection reset".to_string()));
        }
        std::fs::write(local_path, &self.snapshot)
            .map_err(|e| ExecError::Copy(e.to_string()))
    }

    async fn copy_to(
        &self,
        _local_path: &Path,
        _remote_path: &str,
        _timeout: Duration,
    ) -> ExecResult<()> {
        Ok(())
    }
}

pub struct FakeRunnerFactory {
    runner: Arc<FakeRunner>,
}

impl FakeRunnerFactory {
    pub fn new(runner: Arc<FakeRunner>) -> Self {
        Self { runner }
    }
}

impl RunnerFactory for FakeRunnerFactory {
    fn for_endpoint(&self, _host: &str, _user: &str, _port: u16) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner) as Arc<dyn CommandRunner>
    }
}

/// Controller state on tempdir-backed storage with a scripted runner.
pub fn test_state(dir: &Path, runner: Arc<FakeRunner>) -> AppState {
    test_state_with_auth(dir, runner, None)
}

pub fn test_state_with_auth(
    dir: &Path,
    runner: Arc<FakeRunner>,
    auth_token: Option<String>,
) -> AppState {
    let config = ServerConfig {
        bind: "127.0.0.1:0".parse().expect("bind"),
        state_dir: dir.join("state"),
        backup_dir: dir.join("backups"),
        auth_token,
        trace_sample_rate: 1.0,
        default_ssh_user: "slm".to_string(),
    };
    AppState::new(config, Arc::new(FakeRunnerFactory::new(runner)))
}

/// Serve the controller on an ephemeral port; returns the base URL.
pub async fn spawn_server(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });
    format!("http://{addr}")
}
