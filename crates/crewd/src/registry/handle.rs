//! Client interface for interacting with session actors.
//!
//! `RegistryHandle` is a cheap-to-clone handle over the session index. It
//! resolves a key to a `SessionHandle` under a short read lock, releases the
//! lock, then talks to that session's actor. The index lock is never held
//! across an actor round trip.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};

use crew_core::{
    EnqueueOutcome, EventKind, Intent, LaunchOptions, LaunchToken, ProjectRef, SessionId,
    SessionKey, SessionSummary, StreamEvent,
};

use super::actor::{SessionActor, SessionSeed};
use super::broadcaster::{Binding, SubscriberId};
use super::commands::{RegistryError, SessionCommand, Subscription};
use super::RegistryConfig;
use crate::launcher::Launcher;

/// Key → session lookup table. Several keys can point at one session.
pub type SessionIndex = Arc<RwLock<HashMap<SessionKey, SessionHandle>>>;

// ============================================================================
// Session Handle
// ============================================================================

/// Sender side of one session actor.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(sender: mpsc::Sender<SessionCommand>) -> Self {
        Self { sender }
    }

    /// True if both handles address the same actor.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.sender.same_channel(&other.sender)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    pub async fn append(&self, kind: EventKind) -> Result<u64, RegistryError> {
        self.request(|respond_to| SessionCommand::Append { kind, respond_to })
            .await?
    }

    pub async fn announce(
        &self,
        token: LaunchToken,
        session_id: SessionId,
    ) -> Result<SessionId, RegistryError> {
        self.request(|respond_to| SessionCommand::Announce {
            token,
            session_id,
            respond_to,
        })
        .await?
    }

    pub async fn cancel(&self) -> Result<(), RegistryError> {
        self.request(|respond_to| SessionCommand::Cancel { respond_to })
            .await?
    }

    pub async fn continue_with(
        &self,
        prompt: String,
        options: Option<LaunchOptions>,
    ) -> Result<LaunchToken, RegistryError> {
        self.request(|respond_to| SessionCommand::Continue {
            prompt,
            options,
            respond_to,
        })
        .await?
    }

    pub async fn enqueue(&self, prompt: String) -> Result<EnqueueOutcome, RegistryError> {
        self.request(|respond_to| SessionCommand::Enqueue { prompt, respond_to })
            .await?
    }

    pub async fn subscribe(&self, binding: Binding) -> Result<Subscription, RegistryError> {
        self.request(|respond_to| SessionCommand::Subscribe {
            binding,
            respond_to,
        })
        .await
    }

    /// Fire-and-forget; a closed actor has no subscribers left anyway.
    pub async fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.sender.send(SessionCommand::Unsubscribe { id }).await;
    }

    pub async fn summary(&self) -> Result<SessionSummary, RegistryError> {
        self.request(|respond_to| SessionCommand::GetSummary { respond_to })
            .await
    }

    pub async fn output(&self, after: Option<u64>) -> Result<Vec<StreamEvent>, RegistryError> {
        self.request(|respond_to| SessionCommand::GetOutput { after, respond_to })
            .await
    }

    pub async fn evictable(&self, retention: Duration) -> Result<bool, RegistryError> {
        self.request(|respond_to| SessionCommand::Evictable {
            retention,
            respond_to,
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        self.request(|tx| SessionCommand::Shutdown {
            respond_to: Some(tx),
        })
        .await
    }
}

// ============================================================================
// Registry Handle
// ============================================================================

struct RegistryInner {
    index: SessionIndex,
    launcher: Arc<Launcher>,
    config: RegistryConfig,
}

/// Handle for interacting with the session registry.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
///
/// # Usage
///
/// ```ignore
/// let token = registry.start_session(project, "fix the tests", options).await?;
/// let sub = registry.subscribe(SessionKey::Token(token)).await?;
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    inner: Arc<RegistryInner>,
}

/// Non-owning registry reference for background tasks.
pub(crate) struct WeakRegistryHandle(Weak<RegistryInner>);

impl RegistryHandle {
    pub fn new(launcher: Arc<Launcher>, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                index: Arc::new(RwLock::new(HashMap::new())),
                launcher,
                config,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakRegistryHandle {
        WeakRegistryHandle(Arc::downgrade(&self.inner))
    }

    pub(crate) fn upgrade(weak: &WeakRegistryHandle) -> Option<Self> {
        weak.0.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    async fn lookup(&self, key: &SessionKey) -> Result<SessionHandle, RegistryError> {
        let index = self.inner.index.read().await;
        index
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownSession(key.clone()))
    }

    /// One handle per live session.
    async fn unique_sessions(&self) -> Vec<SessionHandle> {
        let index = self.inner.index.read().await;
        let mut unique: Vec<SessionHandle> = Vec::new();
        for handle in index.values() {
            if !unique.iter().any(|known| known.same_session(handle)) {
                unique.push(handle.clone());
            }
        }
        unique
    }

    fn spawn_session(&self, seed: SessionSeed) -> SessionHandle {
        SessionActor::spawn(
            seed,
            Arc::clone(&self.inner.index),
            Arc::clone(&self.inner.launcher),
            self.inner.config.clone(),
        )
    }

    // ------------------------------------------------------------------------
    // Launching
    // ------------------------------------------------------------------------

    /// Spawns a fresh agent in `project` and returns its launch token.
    ///
    /// # Errors
    ///
    /// - `RegistryError::Launch` if the project or binary is unusable or the
    ///   spawn fails
    pub async fn start_session(
        &self,
        project: ProjectRef,
        prompt: &str,
        options: LaunchOptions,
    ) -> Result<LaunchToken, RegistryError> {
        if prompt.trim().is_empty() {
            return Err(RegistryError::invalid("prompt is empty"));
        }
        let launched = self
            .inner
            .launcher
            .launch(&Intent::New, &project, prompt, &options)
            .await?;
        let token = launched.token.clone();

        let handle = self.spawn_session(SessionSeed {
            project,
            options,
            session_id: None,
            launched,
            prompt: Some(prompt.to_string()),
        });
        self.inner
            .index
            .write()
            .await
            .insert(SessionKey::Token(token.clone()), handle);

        Ok(token)
    }

    /// Runs a follow-up prompt on a tracked session.
    ///
    /// # Errors
    ///
    /// - `RegistryError::UnknownSession` if the id is not tracked
    /// - `RegistryError::SessionBusy` while a process is attached
    pub async fn continue_session(
        &self,
        session_id: &SessionId,
        prompt: &str,
    ) -> Result<LaunchToken, RegistryError> {
        if prompt.trim().is_empty() {
            return Err(RegistryError::invalid("prompt is empty"));
        }
        let handle = self.lookup(&SessionKey::Id(session_id.clone())).await?;
        handle.continue_with(prompt.to_string(), None).await
    }

    /// Resumes a conversation, tracked or not.
    ///
    /// A tracked session gets a continuation attachment. An untracked id
    /// needs `project` and becomes a new registry entry with its id known
    /// up front.
    pub async fn resume_session(
        &self,
        session_id: &SessionId,
        prompt: &str,
        project: Option<ProjectRef>,
        options: Option<LaunchOptions>,
    ) -> Result<LaunchToken, RegistryError> {
        if prompt.trim().is_empty() {
            return Err(RegistryError::invalid("prompt is empty"));
        }
        if let Ok(handle) = self.lookup(&SessionKey::Id(session_id.clone())).await {
            return handle.continue_with(prompt.to_string(), options).await;
        }

        let project = project.ok_or_else(|| {
            RegistryError::invalid(format!(
                "session {session_id} is not tracked; a project path is required"
            ))
        })?;
        let options = options.unwrap_or_default();
        let launched = self
            .inner
            .launcher
            .launch(&Intent::Resume(session_id.clone()), &project, prompt, &options)
            .await?;
        let token = launched.token.clone();

        let handle = self.spawn_session(SessionSeed {
            project,
            options,
            session_id: Some(session_id.clone()),
            launched,
            prompt: Some(prompt.to_string()),
        });
        {
            let mut index = self.inner.index.write().await;
            index.insert(SessionKey::Token(token.clone()), handle.clone());
            index.insert(SessionKey::Id(session_id.clone()), handle);
        }
        info!(session_id = %session_id, token = %token, "Resumed untracked session");
        Ok(token)
    }

    /// Requests cancellation. Returns once the kill is requested; the
    /// completion event follows on the stream.
    pub async fn cancel_session(&self, key: &SessionKey) -> Result<(), RegistryError> {
        self.lookup(key).await?.cancel().await
    }

    /// Queues a prompt, or runs it immediately when nothing is attached.
    pub async fn enqueue_prompt(
        &self,
        key: &SessionKey,
        prompt: &str,
    ) -> Result<EnqueueOutcome, RegistryError> {
        self.lookup(key).await?.enqueue(prompt.to_string()).await
    }

    // ------------------------------------------------------------------------
    // Stream
    // ------------------------------------------------------------------------

    /// Binds the session id of the attachment `token`. Binds once; later
    /// calls return the id already bound.
    pub async fn register_announcement(
        &self,
        token: &LaunchToken,
        session_id: SessionId,
    ) -> Result<SessionId, RegistryError> {
        self.lookup(&SessionKey::Token(token.clone()))
            .await?
            .announce(token.clone(), session_id)
            .await
    }

    /// Appends an event to a session stream and returns its seq.
    pub async fn append_event(
        &self,
        key: &SessionKey,
        kind: EventKind,
    ) -> Result<u64, RegistryError> {
        self.lookup(key).await?.append(kind).await
    }

    /// Cached output, optionally only after a sequence number.
    pub async fn get_cached_output(
        &self,
        key: &SessionKey,
        after: Option<u64>,
    ) -> Result<Vec<StreamEvent>, RegistryError> {
        self.lookup(key).await?.output(after).await
    }

    /// Subscribes by launch token (generic) or session id (scoped).
    pub async fn subscribe(
        &self,
        key: SessionKey,
    ) -> Result<(SessionHandle, Subscription), RegistryError> {
        let handle = self.lookup(&key).await?;
        let subscription = handle.subscribe(Binding::from(key)).await?;
        Ok((handle, subscription))
    }

    pub async fn unsubscribe(
        &self,
        key: &SessionKey,
        id: SubscriberId,
    ) -> Result<(), RegistryError> {
        self.lookup(key).await?.unsubscribe(id).await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn get_session(&self, key: &SessionKey) -> Result<SessionSummary, RegistryError> {
        self.lookup(key).await?.summary().await
    }

    /// Every tracked session, oldest first.
    pub async fn list_all(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        for handle in self.unique_sessions().await {
            if let Ok(summary) = handle.summary().await {
                summaries.push(summary);
            }
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Sessions that have not reached a terminal status.
    pub async fn list_running(&self) -> Vec<SessionSummary> {
        self.list_all()
            .await
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Drops a session and every key pointing at it, killing its process.
    pub async fn remove(&self, key: &SessionKey) -> Result<(), RegistryError> {
        let handle = self.lookup(key).await?;
        self.forget(&handle).await;
        let _ = handle.shutdown().await;
        Ok(())
    }

    async fn forget(&self, handle: &SessionHandle) {
        let mut index = self.inner.index.write().await;
        index.retain(|_, known| !known.same_session(handle));
    }

    /// Removes idle sessions past retention with no subscribers. Returns
    /// how many were removed.
    pub async fn cleanup_stale(&self) -> usize {
        let retention = self.inner.config.retention;
        let mut removed = 0;

        for handle in self.unique_sessions().await {
            let evict = match handle.evictable(retention).await {
                Ok(evict) => evict,
                // Actor is gone; drop its keys.
                Err(_) => true,
            };
            if evict {
                self.forget(&handle).await;
                let _ = handle.shutdown().await;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "Removed stale sessions");
        }
        removed
    }

    /// Kills every attached process and stops all actors.
    pub async fn shutdown_all(&self) {
        let sessions = self.unique_sessions().await;
        info!(count = sessions.len(), "Shutting down all sessions");
        self.inner.index.write().await.clear();
        for handle in sessions {
            let _ = handle.shutdown().await;
        }
    }

    /// Number of distinct tracked sessions.
    pub async fn len(&self) -> usize {
        self.unique_sessions().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.index.read().await.is_empty()
    }
}
