//! Scripted agent processes for integration tests.
//!
//! `FakeSpawner` hands every spawned "process" to the test as a
//! `FakeAgent`, which writes stdout lines and decides when (and how) the
//! process exits.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crew_core::{ProjectRef, StreamEvent};
use crewd::launcher::{
    ExitInfo, LaunchError, LaunchSpec, Launcher, ProcessControl, SpawnedProcess, Spawner,
};
use crewd::registry::{spawn_registry, RegistryConfig, RegistryHandle};

pub const STEP: Duration = Duration::from_secs(5);

/// Test side of one spawned process.
pub struct FakeAgent {
    pub spec: LaunchSpec,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    exit: mpsc::UnboundedSender<ExitInfo>,
    kills: Arc<AtomicUsize>,
}

impl FakeAgent {
    pub async fn emit(&mut self, value: Value) {
        let stdout = self.stdout.as_mut().expect("stdout already closed");
        let mut line = value.to_string();
        line.push('\n');
        stdout.write_all(line.as_bytes()).await.expect("write stdout");
    }

    pub async fn emit_raw(&mut self, raw: &str) {
        let stdout = self.stdout.as_mut().expect("stdout already closed");
        stdout.write_all(raw.as_bytes()).await.expect("write stdout");
    }

    pub async fn stderr(&mut self, line: &str) {
        let stderr = self.stderr.as_mut().expect("stderr already closed");
        stderr
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write stderr");
    }

    pub async fn init(&mut self, session_id: &str) {
        self.emit(json!({
            "type": "system",
            "subtype": "init",
            "session_id": session_id,
            "model": "claude-sonnet",
        }))
        .await;
    }

    pub async fn result(&mut self) {
        self.emit(json!({"type": "result", "subtype": "success"})).await;
    }

    /// Closes the pipes, then exits with `code`.
    pub fn exit(mut self, code: i32) {
        self.stdout.take();
        self.stderr.take();
        let _ = self.exit.send(ExitInfo::from_code(code));
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Prompt passed with `-p`.
    pub fn prompt(&self) -> Option<&str> {
        let args = &self.spec.args;
        args.iter()
            .position(|a| a == "-p")
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    /// Session id passed with `--resume`.
    pub fn resumed(&self) -> Option<&str> {
        let args = &self.spec.args;
        args.iter()
            .position(|a| a == "--resume")
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }
}

struct FakeControl {
    exit_rx: mpsc::UnboundedReceiver<ExitInfo>,
    exit_tx: mpsc::UnboundedSender<ExitInfo>,
    kills: Arc<AtomicUsize>,
    ignore_kill: bool,
}

#[async_trait]
impl ProcessControl for FakeControl {
    fn start_kill(&mut self) -> std::io::Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_kill {
            let _ = self.exit_tx.send(ExitInfo::killed());
        }
        Ok(())
    }

    async fn wait(&mut self) -> std::io::Result<ExitInfo> {
        match self.exit_rx.recv().await {
            Some(exit) => Ok(exit),
            None => std::future::pending().await,
        }
    }
}

/// Spawner whose processes are driven by the test.
pub struct FakeSpawner {
    agents: mpsc::UnboundedSender<FakeAgent>,
    ignore_kill: bool,
}

impl Spawner for FakeSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedProcess, LaunchError> {
        let (stdout_theirs, stdout_ours) = tokio::io::duplex(64 * 1024);
        let (stderr_theirs, stderr_ours) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let kills = Arc::new(AtomicUsize::new(0));

        let agent = FakeAgent {
            spec: spec.clone(),
            stdout: Some(stdout_ours),
            stderr: Some(stderr_ours),
            exit: exit_tx.clone(),
            kills: Arc::clone(&kills),
        };
        self.agents
            .send(agent)
            .map_err(|_| LaunchError::SpawnFailed {
                program: spec.program.display().to_string(),
                message: "test harness gone".to_string(),
            })?;

        Ok(SpawnedProcess {
            pid: Some(4242),
            stdout: Box::new(stdout_theirs),
            stderr: Some(Box::new(stderr_theirs)),
            control: Box::new(FakeControl {
                exit_rx,
                exit_tx,
                kills,
                ignore_kill: self.ignore_kill,
            }),
        })
    }
}

/// A registry wired to fake agents, plus a project directory.
pub struct Harness {
    pub registry: RegistryHandle,
    pub agents: mpsc::UnboundedReceiver<FakeAgent>,
    pub project_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(false, test_config())
    }

    pub fn ignoring_kill(cancel_grace: Duration) -> Self {
        Self::with(
            true,
            RegistryConfig {
                cancel_grace,
                ..test_config()
            },
        )
    }

    pub fn with(ignore_kill: bool, config: RegistryConfig) -> Self {
        let (tx, agents) = mpsc::unbounded_channel();
        let spawner = FakeSpawner {
            agents: tx,
            ignore_kill,
        };
        let launcher = Launcher::with_binary("/opt/fake/claude", Arc::new(spawner));
        Self {
            registry: spawn_registry(Arc::new(launcher), config),
            agents,
            project_dir: tempfile::tempdir().expect("create project dir"),
        }
    }

    pub fn project(&self) -> ProjectRef {
        project_in(&self.project_dir)
    }

    pub async fn next_agent(&mut self) -> FakeAgent {
        timeout(STEP, self.agents.recv())
            .await
            .expect("timed out waiting for a spawn")
            .expect("spawner dropped")
    }
}

/// Short drain so killed fakes whose pipes stay open finish quickly.
pub fn test_config() -> RegistryConfig {
    RegistryConfig {
        drain_timeout: Duration::from_millis(100),
        ..RegistryConfig::default()
    }
}

pub fn project_in(dir: &TempDir) -> ProjectRef {
    ProjectRef::new(dir.path().display().to_string()).expect("valid project path")
}

/// Receives one event or fails the test.
pub async fn recv_event(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
    timeout(STEP, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("subscription closed")
}

/// Receives events until `pred` matches, returning everything received.
pub async fn recv_until(
    rx: &mut mpsc::UnboundedReceiver<StreamEvent>,
    pred: impl Fn(&StreamEvent) -> bool,
) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        let event = recv_event(rx).await;
        let done = pred(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Polls until `check` holds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(STEP, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
