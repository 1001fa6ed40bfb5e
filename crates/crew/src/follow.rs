//! Following a session stream from the client side.
//!
//! A fresh launch is followed by its token: events arrive on the generic
//! binding until the agent announces its session id, at which point the
//! daemon re-binds the subscription and the cache is merged once to close
//! any gap. An existing session is followed by id with its full backlog.
//!
//! ```text
//! subscribe(token) ──▶ backlog ──▶ on_generic ... Announced
//!                                                  │ Reconcile(id)
//!                                  get_output(id) ◀┘
//!                                        │
//!                      reconcile ──▶ on_scoped ... Completed
//! ```

use crew_core::{
    LaunchToken, SessionId, SessionKey, StreamEvent, StreamSynchronizer, SyncAction,
};
use tracing::debug;

use crate::client::DaemonClient;
use crate::error::Result;

/// What to follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One attachment, until it completes.
    Launch(LaunchToken),
    /// A session, until it has nothing running or queued.
    Session(SessionId),
}

impl Target {
    fn key(&self) -> SessionKey {
        match self {
            Self::Launch(token) => SessionKey::Token(token.clone()),
            Self::Session(id) => SessionKey::Id(id.clone()),
        }
    }
}

/// Streams `target` into `sink`, each event once and in sequence order.
///
/// Returns the last completion event seen, if any.
pub async fn follow<F>(
    client: &mut DaemonClient,
    target: Target,
    mut sink: F,
) -> Result<Option<StreamEvent>>
where
    F: FnMut(&StreamEvent),
{
    let backlog = client.subscribe(target.key()).await?;
    let mut sync = match &target {
        Target::Launch(token) => {
            let mut sync = StreamSynchronizer::new(token.clone());
            for event in backlog {
                step(client, &mut sync, event).await?;
            }
            sync
        }
        Target::Session(id) => {
            let mut sync = StreamSynchronizer::for_session(id.clone());
            sync.reconcile(backlog);
            sync
        }
    };

    let mut shown = 0;
    emit(&sync, &mut shown, &mut sink);

    while !done(client, &target, &sync).await? {
        let event = client.next_event().await?;
        step(client, &mut sync, event).await?;
        emit(&sync, &mut shown, &mut sink);
    }

    if sync.duplicates() > 0 {
        debug!(duplicates = sync.duplicates(), "Dropped duplicate deliveries");
    }
    Ok(sync.view().filter(|e| e.is_completion()).last().cloned())
}

async fn step(
    client: &mut DaemonClient,
    sync: &mut StreamSynchronizer,
    event: StreamEvent,
) -> Result<()> {
    let action = if sync.is_bound() {
        sync.on_scoped(event)
    } else {
        sync.on_generic(event)
    };
    if let SyncAction::Reconcile(session_id) = action {
        let cached = client.get_output(&session_id, None).await?;
        let added = sync.reconcile(cached);
        debug!(session_id = %session_id, added, "Reconciled with the daemon cache");
    }
    Ok(())
}

/// Hands every not yet shown event to `sink`.
fn emit<F: FnMut(&StreamEvent)>(sync: &StreamSynchronizer, shown: &mut u64, sink: &mut F) {
    let after = *shown;
    for event in sync.view().filter(|e| e.seq > after) {
        sink(event);
        *shown = event.seq;
    }
}

async fn done(
    client: &mut DaemonClient,
    target: &Target,
    sync: &StreamSynchronizer,
) -> Result<bool> {
    if !sync.is_finished() {
        return Ok(false);
    }
    match target {
        Target::Launch(_) => Ok(true),
        // A queued prompt starts right after the completion.
        Target::Session(id) => {
            let summary = client.get_session(SessionKey::Id(id.clone())).await?;
            Ok(summary.pid.is_none() && summary.pending_prompts == 0)
        }
    }
}
