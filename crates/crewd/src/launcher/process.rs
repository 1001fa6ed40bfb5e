//! Process spawning seam.
//!
//! The registry never touches `tokio::process` directly. It asks a
//! [`Spawner`] for a [`SpawnedProcess`] and drives it through the
//! [`ProcessControl`] trait, so tests can substitute scripted processes
//! that emit canned output, ignore kills or exit with arbitrary codes.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::debug;

use super::LaunchError;

/// Everything needed to start one agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Variables set on top of the inherited environment.
    pub env: HashMap<String, String>,
}

/// How an attachment's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub success: bool,
}

impl ExitInfo {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            success: code == 0,
        }
    }

    /// A process that died without an exit code.
    pub fn killed() -> Self {
        Self {
            code: None,
            success: false,
        }
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

/// Kill and wait operations on a running process.
#[async_trait]
pub trait ProcessControl: Send {
    /// Requests termination without waiting for it.
    fn start_kill(&mut self) -> io::Result<()>;

    /// Waits for the process to exit. Must be cancel safe.
    async fn wait(&mut self) -> io::Result<ExitInfo>;
}

/// A started process with its output pipes detached.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub control: Box<dyn ProcessControl>,
}

impl fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.pid)
            .field("stderr", &self.stderr.is_some())
            .finish_non_exhaustive()
    }
}

/// Starts processes described by a [`LaunchSpec`].
pub trait Spawner: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedProcess, LaunchError>;
}

// ============================================================================
// Tokio implementation
// ============================================================================

/// Production spawner backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedProcess, LaunchError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| LaunchError::SpawnFailed {
            program: spec.program.display().to_string(),
            message: e.to_string(),
        })?;

        let pid = child.id();
        let stdout = child.stdout.take().ok_or_else(|| LaunchError::SpawnFailed {
            program: spec.program.display().to_string(),
            message: "stdout was not captured".to_string(),
        })?;
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);

        debug!(pid = ?pid, program = %spec.program.display(), "Spawned agent process");

        Ok(SpawnedProcess {
            pid,
            stdout: Box::new(stdout),
            stderr,
            control: Box::new(TokioChild { child }),
        })
    }
}

struct TokioChild {
    child: Child,
}

#[async_trait]
impl ProcessControl for TokioChild {
    fn start_kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            // Already reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        self.child.wait().await.map(ExitInfo::from)
    }
}
