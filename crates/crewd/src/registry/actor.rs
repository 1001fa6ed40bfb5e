//! Session actor: the single owner of one session's state.
//!
//! Every session runs its own actor task, so a slow or chatty session never
//! delays another one. The actor owns the output cache, the prompt queue
//! and the subscriber list; anything that must be atomic with respect to
//! appends (replay snapshots, re-binding) happens inside one command step.
//!
//! ```text
//!   RegistryHandle ──SessionCommand──▶ ┌──────────────┐ ──publish──▶ subscribers
//!   supervisor     ──Output/Exited───▶ │ SessionActor │
//!   grace timer    ──GraceElapsed────▶ └──────────────┘ ──insert───▶ index
//! ```
//!
//! # Attachment lifecycle
//!
//! Each process attachment gets a new `generation`. The completion event of
//! a generation is written exactly once: whichever of exit or cancel grace
//! arrives first finalizes it, later reports for that generation are
//! dropped.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Closed response channels are ignored; the caller sees `ChannelClosed`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crew_core::{
    EnqueueOutcome, EventKind, Intent, LaunchOptions, LaunchToken, OutputCache, Outcome,
    ProjectRef, PromptQueue, SessionId, SessionKey, SessionStatus, SessionSummary, StreamEvent,
};
use crew_protocol::AgentRecord;

use super::attachment::{spawn_attachment, AttachmentParams};
use super::broadcaster::{Binding, Broadcaster};
use super::commands::{RegistryError, SessionCommand, Subscription};
use super::handle::{SessionHandle, SessionIndex};
use super::RegistryConfig;
use crate::launcher::{ExitInfo, LaunchedProcess, Launcher};

/// Capacity of a session actor's command channel.
pub const SESSION_COMMAND_BUFFER: usize = 256;

/// The process currently attached to a session.
struct LiveAttachment {
    generation: u64,
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Everything needed to start a session actor.
pub(crate) struct SessionSeed {
    pub project: ProjectRef,
    pub options: LaunchOptions,
    /// Known up front when resuming a stored conversation.
    pub session_id: Option<SessionId>,
    pub launched: LaunchedProcess,
    /// Prompt of the first attachment, recorded as `PromptStarted`.
    pub prompt: Option<String>,
}

pub(crate) struct SessionActor {
    receiver: mpsc::Receiver<SessionCommand>,
    self_sender: mpsc::WeakSender<SessionCommand>,
    index: SessionIndex,
    launcher: Arc<Launcher>,
    config: RegistryConfig,

    project: ProjectRef,
    options: LaunchOptions,
    session_id: Option<SessionId>,
    /// Id to resume with; differs from `session_id` when the agent forked.
    resume_target: Option<SessionId>,
    model: Option<String>,

    status: SessionStatus,
    launch_token: LaunchToken,
    generation: u64,
    finalized_generation: u64,
    attachment: Option<LiveAttachment>,
    exit_code: Option<i32>,
    /// Prompts dropped by a cancel, reported in the completion event.
    dropped_on_cancel: usize,
    announced_tokens: HashSet<LaunchToken>,

    queue: PromptQueue,
    cache: OutputCache,
    next_seq: u64,
    broadcaster: Broadcaster,

    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    last_activity: Instant,
}

impl SessionActor {
    /// Spawns the actor for a freshly launched session and returns its handle.
    pub(crate) fn spawn(
        seed: SessionSeed,
        index: SessionIndex,
        launcher: Arc<Launcher>,
        config: RegistryConfig,
    ) -> SessionHandle {
        let (sender, receiver) = mpsc::channel(SESSION_COMMAND_BUFFER);
        let now = Utc::now();

        let mut actor = Self {
            receiver,
            self_sender: sender.downgrade(),
            index,
            launcher,
            cache: OutputCache::new(config.cache_capacity),
            config,
            project: seed.project,
            options: seed.options.clone(),
            resume_target: seed.session_id.clone(),
            session_id: seed.session_id,
            model: seed.options.model.clone(),
            status: SessionStatus::Starting,
            launch_token: seed.launched.token.clone(),
            generation: 0,
            finalized_generation: 0,
            attachment: None,
            exit_code: None,
            dropped_on_cancel: 0,
            announced_tokens: HashSet::new(),
            queue: PromptQueue::new(),
            next_seq: 1,
            broadcaster: Broadcaster::new(),
            created_at: now,
            last_activity_at: now,
            last_activity: Instant::now(),
        };
        actor.attach(seed.launched, sender.clone());
        if let Some(prompt) = seed.prompt {
            actor.append(EventKind::PromptStarted {
                order: None,
                prompt,
            });
        }

        tokio::spawn(actor.run());
        SessionHandle::new(sender)
    }

    async fn run(mut self) {
        debug!(token = %self.launch_token, "Session actor started");

        while let Some(cmd) = self.receiver.recv().await {
            if !self.handle(cmd).await {
                break;
            }
        }

        self.kill_attachment();
        debug!(
            session_id = ?self.session_id,
            token = %self.launch_token,
            "Session actor stopped"
        );
    }

    /// Applies one command. Returns false to stop the actor.
    async fn handle(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Append { kind, respond_to } => {
                let seq = self.append(kind);
                let _ = respond_to.send(Ok(seq));
            }

            SessionCommand::Announce {
                token,
                session_id,
                respond_to,
            } => {
                let record = serde_json::json!({
                    "type": "system",
                    "subtype": "init",
                    "session_id": session_id.as_str(),
                });
                let bound = self.announce(token, session_id, record).await;
                let _ = respond_to.send(Ok(bound));
            }

            SessionCommand::Output { generation, record } => {
                if self.accepts(generation) {
                    self.on_record(record).await;
                }
            }

            SessionCommand::Stderr { generation, line } => {
                if self.accepts(generation) {
                    self.append(EventKind::Stderr { line });
                }
            }

            SessionCommand::StreamError {
                generation,
                message,
            } => {
                if self.accepts(generation) {
                    warn!(token = %self.launch_token, error = %message, "Agent stream error");
                    self.append(EventKind::StreamError { message });
                }
            }

            SessionCommand::Exited { generation, exit } => {
                self.on_exit(generation, exit).await;
            }

            SessionCommand::GraceElapsed { generation } => {
                self.on_grace_elapsed(generation);
            }

            SessionCommand::Cancel { respond_to } => {
                self.cancel();
                let _ = respond_to.send(Ok(()));
            }

            SessionCommand::Continue {
                prompt,
                options,
                respond_to,
            } => {
                let result = self.continue_with(prompt, options).await;
                let _ = respond_to.send(result);
            }

            SessionCommand::Enqueue { prompt, respond_to } => {
                let result = self.enqueue(prompt).await;
                let _ = respond_to.send(result);
            }

            SessionCommand::Subscribe {
                binding,
                respond_to,
            } => {
                let subscription = self.subscribe(binding);
                if let Err(subscription) = respond_to.send(subscription) {
                    self.broadcaster.unsubscribe(subscription.id);
                }
            }

            SessionCommand::Unsubscribe { id } => {
                self.broadcaster.unsubscribe(id);
            }

            SessionCommand::GetSummary { respond_to } => {
                let _ = respond_to.send(self.summary());
            }

            SessionCommand::GetOutput { after, respond_to } => {
                let events = match after {
                    Some(after) => self.cache.since(after),
                    None => self.cache.snapshot(),
                };
                let _ = respond_to.send(events);
            }

            SessionCommand::Evictable {
                retention,
                respond_to,
            } => {
                let _ = respond_to.send(self.evictable(retention));
            }

            SessionCommand::Shutdown { respond_to } => {
                info!(
                    session_id = ?self.session_id,
                    token = %self.launch_token,
                    "Shutting down session"
                );
                self.kill_attachment();
                if let Some(tx) = respond_to {
                    let _ = tx.send(());
                }
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------------
    // Stream
    // ------------------------------------------------------------------------

    /// Appends an event to the cache and publishes it. Returns its seq.
    fn append(&mut self, kind: EventKind) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);

        let event = StreamEvent {
            seq,
            launch_token: self.launch_token.clone(),
            session_id: self.session_id.clone(),
            timestamp: Utc::now(),
            kind,
        };
        self.touch();
        self.cache.push(event.clone());
        self.broadcaster.publish(&event);
        seq
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
        self.last_activity = Instant::now();
    }

    /// True if reports of `generation` still count.
    fn accepts(&self, generation: u64) -> bool {
        generation == self.generation && self.finalized_generation < generation
    }

    async fn on_record(&mut self, record: AgentRecord) {
        if self.status == SessionStatus::Starting {
            self.status = SessionStatus::Running;
        }

        if let Some(model) = record.model() {
            self.model = Some(model.to_string());
        }

        match record {
            AgentRecord::Init { session_id, record } => {
                let token = self.launch_token.clone();
                self.announce(token, session_id, record).await;
            }
            AgentRecord::Result(record) => {
                self.append(EventKind::TurnResult { record });
                if self.status == SessionStatus::Running {
                    self.status = SessionStatus::Idle;
                }
            }
            AgentRecord::Payload(record) => {
                self.append(EventKind::Record { record });
            }
        }
    }

    /// Binds the session id (once), appends the announcement and re-binds
    /// the token's generic subscribers. Returns the bound id.
    async fn announce(
        &mut self,
        token: LaunchToken,
        announced: SessionId,
        record: serde_json::Value,
    ) -> SessionId {
        let bound = match &self.session_id {
            None => {
                info!(
                    session_id = %announced,
                    token = %token,
                    project = %self.project.path,
                    "Session announced"
                );
                self.session_id = Some(announced.clone());
                self.resume_target = Some(announced.clone());
                self.index_insert(SessionKey::Id(announced.clone())).await;
                announced.clone()
            }
            Some(bound) if bound == &announced => bound.clone(),
            Some(bound) => {
                info!(
                    session_id = %bound,
                    announced = %announced,
                    "Agent announced a new conversation id, tracking it as an alias"
                );
                let bound = bound.clone();
                self.resume_target = Some(announced.clone());
                self.index_insert(SessionKey::Id(announced)).await;
                bound
            }
        };

        if self.announced_tokens.insert(token.clone()) {
            self.append(EventKind::Announced {
                session_id: bound.clone(),
                record,
            });
            self.broadcaster.rebind(&token, &bound);
        }
        bound
    }

    // ------------------------------------------------------------------------
    // Attachments
    // ------------------------------------------------------------------------

    /// Starts supervising a spawned process as the next generation.
    fn attach(&mut self, launched: LaunchedProcess, sender: mpsc::Sender<SessionCommand>) {
        self.generation = self.generation.saturating_add(1);
        self.launch_token = launched.token.clone();
        self.exit_code = None;

        let (kill_tx, kill_rx) = oneshot::channel();
        let pid = launched.spawned.pid;
        let task = spawn_attachment(
            launched.spawned,
            AttachmentParams {
                generation: self.generation,
                token: launched.token,
                sender,
                kill_rx,
                drain_timeout: self.config.drain_timeout,
            },
        );

        self.attachment = Some(LiveAttachment {
            generation: self.generation,
            pid,
            kill: Some(kill_tx),
            task,
        });
    }

    /// Launches a continuation attachment of this session.
    async fn launch_continuation(
        &mut self,
        prompt: String,
        order: Option<u64>,
        options: Option<LaunchOptions>,
    ) -> Result<LaunchToken, RegistryError> {
        let Some(sender) = self.self_sender.upgrade() else {
            return Err(RegistryError::ChannelClosed);
        };
        if let Some(options) = options {
            self.options = options;
        }

        let intent = match self.resume_target.clone().or_else(|| self.session_id.clone()) {
            Some(id) => Intent::Resume(id),
            None => Intent::Continue,
        };
        let launched = self
            .launcher
            .launch(&intent, &self.project, &prompt, &self.options)
            .await?;
        let token = launched.token.clone();

        self.attach(launched, sender);
        self.status = SessionStatus::Running;
        self.index_insert(SessionKey::Token(token.clone())).await;
        self.append(EventKind::PromptStarted { order, prompt });

        info!(
            session_id = ?self.session_id,
            token = %token,
            generation = self.generation,
            intent = %intent,
            "Continuation started"
        );
        Ok(token)
    }

    async fn on_exit(&mut self, generation: u64, exit: ExitInfo) {
        if matches!(&self.attachment, Some(live) if live.generation == generation) {
            self.attachment = None;
        }
        if !self.accepts(generation) {
            debug!(generation, code = ?exit.code, "Ignoring exit of a finalized attachment");
            return;
        }

        self.exit_code = exit.code;
        let outcome = if self.status == SessionStatus::Cancelling {
            Outcome::Cancelled
        } else if exit.success {
            Outcome::Success
        } else {
            Outcome::Failed
        };

        if outcome == Outcome::Failed {
            warn!(
                session_id = ?self.session_id,
                token = %self.launch_token,
                code = ?exit.code,
                "Agent exited abnormally"
            );
        }

        self.finalize(generation, outcome, exit.code);

        if outcome == Outcome::Success {
            self.drain_next().await;
        }
    }

    fn on_grace_elapsed(&mut self, generation: u64) {
        if !self.accepts(generation) || self.status != SessionStatus::Cancelling {
            return;
        }
        warn!(
            session_id = ?self.session_id,
            token = %self.launch_token,
            "Agent did not exit within the cancel grace period, detaching"
        );
        if let Some(live) = self.attachment.take() {
            live.task.abort();
        }
        self.finalize(generation, Outcome::Cancelled, None);
    }

    /// Writes the single completion event of `generation`.
    fn finalize(&mut self, generation: u64, outcome: Outcome, exit_code: Option<i32>) {
        if self.finalized_generation >= generation {
            return;
        }
        self.finalized_generation = generation;

        let mut dropped = std::mem::take(&mut self.dropped_on_cancel);
        if outcome != Outcome::Success {
            dropped += self.queue.clear();
        }

        self.append(EventKind::Completed {
            outcome,
            exit_code,
            dropped_prompts: dropped,
        });

        self.status = match outcome {
            Outcome::Success if self.options.keep_open || !self.queue.is_empty() => {
                SessionStatus::Idle
            }
            other => other.terminal_status(),
        };

        info!(
            session_id = ?self.session_id,
            token = %self.launch_token,
            outcome = %outcome,
            code = ?exit_code,
            dropped,
            "Attachment finished"
        );
    }

    /// Runs the oldest queued prompt, if any.
    async fn drain_next(&mut self) {
        let Some(next) = self.queue.pop() else {
            return;
        };
        debug!(order = next.order, "Running queued prompt");

        if let Err(e) = self
            .launch_continuation(next.prompt, Some(next.order), None)
            .await
        {
            // The prompt that failed to start counts as dropped too.
            let dropped = self.queue.clear() + 1;
            warn!(error = %e, dropped, "Failed to start queued prompt");
            self.append(EventKind::StreamError {
                message: format!("failed to start queued prompt {}: {e}", next.order),
            });
            self.close(Outcome::Failed, dropped);
        }
    }

    /// Ends a session that has no attachment left to finalize.
    fn close(&mut self, outcome: Outcome, dropped: usize) {
        self.append(EventKind::Completed {
            outcome,
            exit_code: None,
            dropped_prompts: dropped,
        });
        self.status = outcome.terminal_status();
        info!(
            session_id = ?self.session_id,
            token = %self.launch_token,
            outcome = %outcome,
            dropped,
            "Session closed"
        );
    }

    fn has_live_process(&self) -> bool {
        self.attachment.is_some()
    }

    fn cancel(&mut self) {
        let live = match &mut self.attachment {
            Some(live) if self.finalized_generation < live.generation => live,
            _ => {
                if !self.status.is_terminal() {
                    debug!(session_id = ?self.session_id, "Cancel without a live process");
                    let dropped = self.queue.clear();
                    self.close(Outcome::Cancelled, dropped);
                }
                return;
            }
        };
        if self.status == SessionStatus::Cancelling {
            return;
        }

        let generation = live.generation;
        if let Some(kill) = live.kill.take() {
            let _ = kill.send(());
        }

        self.status = SessionStatus::Cancelling;
        self.dropped_on_cancel += self.queue.clear();
        info!(
            session_id = ?self.session_id,
            token = %self.launch_token,
            generation,
            "Cancelling session"
        );
        self.append(EventKind::Cancelling);

        if let Some(sender) = self.self_sender.upgrade() {
            let grace = self.config.cancel_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = sender.send(SessionCommand::GraceElapsed { generation }).await;
            });
        }
    }

    fn kill_attachment(&mut self) {
        if let Some(mut live) = self.attachment.take() {
            if let Some(kill) = live.kill.take() {
                let _ = kill.send(());
            }
            // Dropping the supervisor drops the child; kill_on_drop reaps it.
            live.task.abort();
        }
    }

    // ------------------------------------------------------------------------
    // Prompts
    // ------------------------------------------------------------------------

    async fn continue_with(
        &mut self,
        prompt: String,
        options: Option<LaunchOptions>,
    ) -> Result<LaunchToken, RegistryError> {
        if self.has_live_process() {
            return Err(RegistryError::SessionBusy(self.display_id()));
        }
        self.launch_continuation(prompt, None, options).await
    }

    async fn enqueue(&mut self, prompt: String) -> Result<EnqueueOutcome, RegistryError> {
        if prompt.trim().is_empty() {
            return Err(RegistryError::invalid("prompt is empty"));
        }
        if self.status == SessionStatus::Cancelling {
            return Err(RegistryError::invalid("session is being cancelled"));
        }

        if self.has_live_process() {
            let order = self.queue.push(prompt.clone());
            let position = self.queue.len();
            debug!(order, position, "Prompt queued");
            self.append(EventKind::PromptQueued { order, prompt });
            return Ok(EnqueueOutcome::Queued { order, position });
        }

        let order = self.queue.next_order();
        let launch_token = self.launch_continuation(prompt, Some(order), None).await?;
        Ok(EnqueueOutcome::Started {
            order,
            launch_token,
        })
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    fn subscribe(&mut self, requested: Binding) -> Subscription {
        let (binding, backlog) = match requested {
            Binding::Generic(token) => match &self.session_id {
                Some(id) if self.announced_tokens.contains(&token) => {
                    (Binding::Scoped(id.clone()), self.cache.snapshot())
                }
                _ => {
                    let backlog = self.cache.for_token(&token);
                    (Binding::Generic(token), backlog)
                }
            },
            Binding::Scoped(id) => (Binding::Scoped(id), self.cache.snapshot()),
        };

        let (id, receiver) = self.broadcaster.subscribe(binding.clone());
        Subscription {
            id,
            binding,
            backlog,
            receiver,
        }
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            launch_token: self.launch_token.clone(),
            project: self.project.clone(),
            status: self.status,
            generation: self.generation,
            pid: self.attachment.as_ref().and_then(|live| live.pid),
            model: self.model.clone(),
            exit_code: self.exit_code,
            pending_prompts: self.queue.len(),
            last_seq: self.cache.last_seq().unwrap_or(0),
            subscribers: self.broadcaster.live_count(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }

    /// Only terminal sessions expire; an idle `keep_open` session waits for
    /// its next prompt.
    fn evictable(&self, retention: Duration) -> bool {
        !self.has_live_process()
            && self.status.is_terminal()
            && self.broadcaster.live_count() == 0
            && self.last_activity.elapsed() >= retention
    }

    fn display_id(&self) -> String {
        match &self.session_id {
            Some(id) => id.to_string(),
            None => self.launch_token.to_string(),
        }
    }

    async fn index_insert(&self, key: SessionKey) {
        let Some(sender) = self.self_sender.upgrade() else {
            return;
        };
        let mut index = self.index.write().await;
        index.insert(key, SessionHandle::new(sender));
    }
}
