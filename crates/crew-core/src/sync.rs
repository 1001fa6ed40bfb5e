//! Consumer-side stream synchronization.
//!
//! A consumer that requests a launch only knows the launch token. It must
//! listen on the generic channel right away, then switch to the scoped
//! channel once the agent announces its session id:
//!
//! ```text
//! ┌──────────────────────────┐  announcement   ┌────────────────────────┐
//! │  AwaitingAnnouncement    │────────────────▶│  Bound { reconciled }  │
//! │  (buffer generic events) │                 │  (scoped events only)  │
//! └──────────────────────────┘                 └────────────────────────┘
//!                                      │ SyncAction::Reconcile(id)
//!                                      ▼
//!                          get_session_output(id) once,
//!                          merged by sequence number
//! ```
//!
//! Correctness comes from the per-session sequence numbers, not from
//! timing: every event is keyed by `seq`, so replays and live deliveries
//! that overlap collapse into one entry.

use std::collections::BTreeMap;

use tracing::debug;

use crate::event::StreamEvent;
use crate::session::{LaunchToken, SessionId};

/// Where the synchronizer is in the two-phase subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    /// Listening on the generic channel of `token`.
    AwaitingAnnouncement { token: LaunchToken },

    /// Listening on the scoped channel of `session_id`.
    Bound {
        session_id: SessionId,
        reconciled: bool,
    },
}

/// What the consumer must do after feeding an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Keep consuming.
    Continue,

    /// Fetch the cached output of this session once and pass it to
    /// [`StreamSynchronizer::reconcile`].
    Reconcile(SessionId),
}

/// Merged, deduplicated view of one session stream.
#[derive(Debug, Clone)]
pub struct StreamSynchronizer {
    phase: SyncPhase,
    token: Option<LaunchToken>,
    events: BTreeMap<u64, StreamEvent>,
    duplicates: u64,
}

impl StreamSynchronizer {
    /// Starts in `AwaitingAnnouncement` for a freshly requested launch.
    pub fn new(token: LaunchToken) -> Self {
        Self {
            phase: SyncPhase::AwaitingAnnouncement {
                token: token.clone(),
            },
            token: Some(token),
            events: BTreeMap::new(),
            duplicates: 0,
        }
    }

    /// Starts bound to a known session, e.g. when returning to it.
    ///
    /// The consumer still has to reconcile once to replay the cache.
    pub fn for_session(session_id: SessionId) -> Self {
        Self {
            phase: SyncPhase::Bound {
                session_id,
                reconciled: false,
            },
            token: None,
            events: BTreeMap::new(),
            duplicates: 0,
        }
    }

    pub fn phase(&self) -> &SyncPhase {
        &self.phase
    }

    /// Launch token this synchronizer was started for, if any.
    pub fn token(&self) -> Option<&LaunchToken> {
        self.token.as_ref()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match &self.phase {
            SyncPhase::Bound { session_id, .. } => Some(session_id),
            SyncPhase::AwaitingAnnouncement { .. } => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.phase, SyncPhase::Bound { .. })
    }

    /// True once bound but before the one-time cache reconcile.
    pub fn needs_reconcile(&self) -> bool {
        matches!(
            self.phase,
            SyncPhase::Bound {
                reconciled: false,
                ..
            }
        )
    }

    /// Feeds an event received on the generic channel.
    pub fn on_generic(&mut self, event: StreamEvent) -> SyncAction {
        if let SyncPhase::AwaitingAnnouncement { token } = &self.phase {
            if &event.launch_token != token {
                debug!(
                    expected = %token,
                    got = %event.launch_token,
                    seq = event.seq,
                    "Ignoring generic event for another launch"
                );
                return SyncAction::Continue;
            }
        }
        self.accept(event)
    }

    /// Feeds an event received on the scoped channel.
    pub fn on_scoped(&mut self, event: StreamEvent) -> SyncAction {
        if let SyncPhase::Bound { session_id, .. } = &self.phase {
            if event.session_id.as_ref() != Some(session_id) {
                debug!(
                    expected = %session_id,
                    seq = event.seq,
                    "Ignoring scoped event for another session"
                );
                return SyncAction::Continue;
            }
        }
        self.accept(event)
    }

    /// Merges a cache snapshot. Returns how many events were new.
    pub fn reconcile(&mut self, cached: impl IntoIterator<Item = StreamEvent>) -> usize {
        let mut added = 0;
        for event in cached {
            if self.insert(event) {
                added += 1;
            }
        }
        if let SyncPhase::Bound { reconciled, .. } = &mut self.phase {
            *reconciled = true;
        }
        added
    }

    /// Events ordered by sequence number.
    pub fn view(&self) -> impl Iterator<Item = &StreamEvent> {
        self.events.values()
    }

    /// Consumes the synchronizer, returning the ordered events.
    pub fn into_events(self) -> Vec<StreamEvent> {
        self.events.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.events.keys().next_back().copied()
    }

    /// Number of deliveries dropped because their seq was already known.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Sequence numbers missing between the oldest and newest known event.
    pub fn missing(&self) -> Vec<u64> {
        let (Some(first), Some(last)) = (
            self.events.keys().next().copied(),
            self.events.keys().next_back().copied(),
        ) else {
            return Vec::new();
        };
        (first..=last)
            .filter(|seq| !self.events.contains_key(seq))
            .collect()
    }

    /// True once the launch this synchronizer follows has completed.
    ///
    /// Synchronizers created with [`StreamSynchronizer::for_session`] finish
    /// when the newest known event is a completion.
    pub fn is_finished(&self) -> bool {
        match &self.token {
            Some(token) => self
                .events
                .values()
                .any(|e| e.is_completion() && &e.launch_token == token),
            None => self
                .events
                .values()
                .next_back()
                .is_some_and(StreamEvent::is_completion),
        }
    }

    fn accept(&mut self, event: StreamEvent) -> SyncAction {
        let announced = event.announced_session_id().cloned();
        self.insert(event);

        match (&self.phase, announced) {
            (SyncPhase::AwaitingAnnouncement { .. }, Some(session_id)) => {
                debug!(session_id = %session_id, "Announcement observed, rebinding");
                self.phase = SyncPhase::Bound {
                    session_id: session_id.clone(),
                    reconciled: false,
                };
                SyncAction::Reconcile(session_id)
            }
            _ => SyncAction::Continue,
        }
    }

    fn insert(&mut self, event: StreamEvent) -> bool {
        if self.events.contains_key(&event.seq) {
            self.duplicates = self.duplicates.saturating_add(1);
            return false;
        }
        self.events.insert(event.seq, event);
        true
    }
}
