//! Attachment supervisor.
//!
//! One supervisor task per spawned process. It decodes stdout, waits for the
//! exit and applies the kill request, reporting everything to the owning
//! session actor:
//!
//! ```text
//!  stdout ──AgentLineCodec──▶ Output ─┐
//!  stderr ──lines (own task)──▶ Stderr ├──▶ SessionActor
//!  wait() ─────────────────────▶ Exited┘        (mpsc)
//!  kill_rx ──▶ start_kill()
//! ```
//!
//! Output still buffered in the pipes when the process exits is drained
//! (bounded by `drain_timeout`) before `Exited` is sent, so the exit is
//! always the last report of an attachment.

use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crew_core::LaunchToken;
use crew_protocol::{sanitize_line, AgentLineCodec, ParsedLine};

use super::commands::SessionCommand;
use crate::launcher::{ExitInfo, SpawnedProcess};

/// Wiring for one supervisor task.
pub(crate) struct AttachmentParams {
    pub generation: u64,
    pub token: LaunchToken,
    pub sender: mpsc::Sender<SessionCommand>,
    /// Resolves (or closes) when the actor wants the process killed.
    pub kill_rx: oneshot::Receiver<()>,
    pub drain_timeout: Duration,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Step {
    Line(Option<std::io::Result<ParsedLine>>),
    Exited(std::io::Result<ExitInfo>),
    Kill,
}

pub(crate) fn spawn_attachment(
    process: SpawnedProcess,
    params: AttachmentParams,
) -> JoinHandle<()> {
    tokio::spawn(supervise(process, params))
}

async fn supervise(process: SpawnedProcess, params: AttachmentParams) {
    let AttachmentParams {
        generation,
        token,
        sender,
        mut kill_rx,
        drain_timeout,
    } = params;
    let SpawnedProcess {
        pid,
        stdout,
        stderr,
        mut control,
    } = process;

    let mut lines = FramedRead::new(stdout, AgentLineCodec::new());
    let stderr_task = stderr.map(|stderr| {
        AbortOnDrop(tokio::spawn(forward_stderr(
            stderr,
            generation,
            sender.clone(),
        )))
    });

    let mut stdout_open = true;
    let mut kill_requested = false;

    let exit = loop {
        let step = tokio::select! {
            biased;
            next = lines.next(), if stdout_open => Step::Line(next),
            status = control.wait() => Step::Exited(status),
            _ = &mut kill_rx, if !kill_requested => Step::Kill,
        };

        match step {
            Step::Line(Some(item)) => {
                if !forward_line(&sender, generation, item).await {
                    stdout_open = false;
                }
            }
            Step::Line(None) => {
                debug!(token = %token, "Agent stdout closed");
                stdout_open = false;
            }
            Step::Exited(status) => break status,
            Step::Kill => {
                kill_requested = true;
                debug!(token = %token, pid = ?pid, "Killing agent process");
                if let Err(e) = control.start_kill() {
                    warn!(token = %token, pid = ?pid, error = %e, "Failed to kill agent process");
                }
            }
        }

        if sender.is_closed() {
            debug!(token = %token, "Session actor gone, killing agent process");
            let _ = control.start_kill();
            return;
        }
    };

    let exit = exit.unwrap_or_else(|e| {
        warn!(token = %token, pid = ?pid, error = %e, "Failed to wait for agent process");
        ExitInfo::killed()
    });

    if stdout_open {
        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(item) = lines.next().await {
                if !forward_line(&sender, generation, item).await {
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(token = %token, "Timed out draining agent stdout");
        }
    }

    if let Some(mut task) = stderr_task {
        if tokio::time::timeout(drain_timeout, &mut task.0).await.is_err() {
            warn!(token = %token, "Timed out draining agent stderr");
        }
    }

    let skipped = lines.decoder().skipped();
    debug!(
        token = %token,
        pid = ?pid,
        code = ?exit.code,
        skipped,
        "Agent process exited"
    );
    let _ = sender.send(SessionCommand::Exited { generation, exit }).await;
}

/// Sends one decoded line. Returns false once stdout is unusable.
async fn forward_line(
    sender: &mpsc::Sender<SessionCommand>,
    generation: u64,
    item: std::io::Result<ParsedLine>,
) -> bool {
    match item {
        Ok(ParsedLine::Record(record)) => {
            let _ = sender
                .send(SessionCommand::Output { generation, record })
                .await;
            true
        }
        // Logged and counted by the codec.
        Ok(ParsedLine::Skipped(_)) => true,
        Err(e) => {
            let _ = sender
                .send(SessionCommand::StreamError {
                    generation,
                    message: e.to_string(),
                })
                .await;
            false
        }
    }
}

async fn forward_stderr(
    stderr: Box<dyn AsyncRead + Send + Unpin>,
    generation: u64,
    sender: mpsc::Sender<SessionCommand>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = sanitize_line(&line);
                if line.is_empty() {
                    continue;
                }
                if sender
                    .send(SessionCommand::Stderr { generation, line })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Agent stderr read failed");
                break;
            }
        }
    }
}
