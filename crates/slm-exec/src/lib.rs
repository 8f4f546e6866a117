//! Remote command execution for SLM.
//!
//! The controller reaches nodes through a [`CommandRunner`]: a capability with
//! two variants — [`SshRunner`] for managed nodes and [`LocalShellRunner`] for
//! the controller host itself. The variant choice is per node, resolved
//! through a [`RunnerFactory`] so tests can substitute scripted runners.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

// ─── Output / errors ─────────────────────────────────────────────────────────

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr interleaved for job logs, stderr last.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end())
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("copy failed: {0}")]
    Copy(String),
}

pub type ExecResult<T> = Result<T, ExecError>;

// ─── Runner trait ────────────────────────────────────────────────────────────

/// A command execution capability against one endpoint.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Human-readable endpoint label for logs.
    fn describe(&self) -> String;

    /// Run a shell command, bounded by `timeout`. A timeout kills the child.
    async fn run(&self, command: &str, timeout: Duration) -> ExecResult<CommandOutput>;

    /// Fetch a file from the endpoint to a local path (SCP-equivalent).
    async fn copy_from(&self, remote_path: &str, local_path: &Path, timeout: Duration)
        -> ExecResult<()>;

    /// Push a local file to a path on the endpoint.
    async fn copy_to(&self, local_path: &Path, remote_path: &str, timeout: Duration)
        -> ExecResult<()>;
}

/// Resolves the runner variant for a node endpoint.
pub trait RunnerFactory: Send + Sync {
    fn for_endpoint(&self, host: &str, user: &str, port: u16) -> Arc<dyn CommandRunner>;
}

// ─── Shared subprocess plumbing ──────────────────────────────────────────────

async fn run_argv(argv: &[String], limit: Duration) -> ExecResult<CommandOutput> {
    let program = &argv[0];
    let child = Command::new(program)
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::Spawn {
            command: argv.join(" "),
            source: e,
        })?;

    let output = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| ExecError::Timeout(limit))?
        .map_err(|e| ExecError::Spawn {
            command: argv.join(" "),
            source: e,
        })?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

// ─── SSH runner ──────────────────────────────────────────────────────────────

/// Runs commands on a remote node through the system `ssh`/`scp` binaries.
/// Non-interactive: batch mode, no host-key prompts, bounded connect time.
#[derive(Debug, Clone)]
pub struct SshRunner {
    host: String,
    user: String,
    port: u16,
}

impl SshRunner {
    pub fn new(host: impl Into<String>, user: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port,
        }
    }

    fn ssh_argv(&self, command: &str) -> Vec<String> {
        vec![
            "ssh".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "ConnectTimeout=15".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            format!("{}@{}", self.user, self.host),
            command.to_string(),
        ]
    }

    fn scp_argv(&self, from: &str, to: &str) -> Vec<String> {
        vec![
            "scp".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "ConnectTimeout=15".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-P".to_string(),
            self.port.to_string(),
            from.to_string(),
            to.to_string(),
        ]
    }

    fn remote(&self, path: &str) -> String {
        format!("{}@{}:{}", self.user, self.host, path)
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    fn describe(&self) -> String {
        format!("ssh {}@{}:{}", self.user, self.host, self.port)
    }

    async fn run(&self, command: &str, limit: Duration) -> ExecResult<CommandOutput> {
        debug!(endpoint = %self.describe(), %command, "running remote command");
        run_argv(&self.ssh_argv(command), limit).await
    }

    async fn copy_from(
        &self,
        remote_path: &str,
        local_path: &Path,
        limit: Duration,
    ) -> ExecResult<()> {
        let argv = self.scp_argv(&self.remote(remote_path), &local_path.to_string_lossy());
        let out = run_argv(&argv, limit).await?;
        if out.success() {
            Ok(())
        } else {
            Err(ExecError::Copy(out.combined()))
        }
    }

    async fn copy_to(
        &self,
        local_path: &Path,
        remote_path: &str,
        limit: Duration,
    ) -> ExecResult<()> {
        let argv = self.scp_argv(&local_path.to_string_lossy(), &self.remote(remote_path));
        let out = run_argv(&argv, limit).await?;
        if out.success() {
            Ok(())
        } else {
            Err(ExecError::Copy(out.combined()))
        }
    }
}

// ─── Local shell runner ──────────────────────────────────────────────────────

/// Runs commands on the controller host itself. Copies are plain file copies.
#[derive(Debug, Clone, Default)]
pub struct LocalShellRunner;

#[async_trait]
impl CommandRunner for LocalShellRunner {
    fn describe(&self) -> String {
        "local-shell".to_string()
    }

    async fn run(&self, command: &str, limit: Duration) -> ExecResult<CommandOutput> {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ];
        run_argv(&argv, limit).await
    }

    async fn copy_from(
        &self,
        remote_path: &str,
        local_path: &Path,
        _limit: Duration,
    ) -> ExecResult<()> {
        tokio::fs::copy(remote_path, local_path)
            .await
            .map(|_| ())
            .map_err(|e| ExecError::Copy(format!("{remote_path}: {e}")))
    }

    async fn copy_to(
        &self,
        local_path: &Path,
        remote_path: &str,
        _limit: Duration,
    ) -> ExecResult<()> {
        tokio::fs::copy(local_path, remote_path)
            .await
            .map(|_| ())
            .map_err(|e| ExecError::Copy(format!("{remote_path}: {e}")))
    }
}

// ─── Default factory ─────────────────────────────────────────────────────────

/// Production factory: SSH for every endpoint.
#[derive(Debug, Clone, Default)]
pub struct SshRunnerFactory;

impl RunnerFactory for SshRunnerFactory {
    fn for_endpoint(&self, host: &str, user: &str, port: u16) -> Arc<dyn CommandRunner> {
        Arc::new(SshRunner::new(host, user, port))
    }
}
