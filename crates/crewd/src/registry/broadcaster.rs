//! Per-session event fan-out.
//!
//! Every subscriber holds exactly one binding at a time:
//!
//! ```text
//! Generic(launch_token) ──announcement──▶ Scoped(session_id)
//! ```
//!
//! `publish` matches each subscriber once against its binding, so an event
//! can never reach the same subscriber twice. The session actor publishes
//! the announcement first and re-binds afterwards; every later event then
//! arrives through the scoped binding only.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crew_core::{LaunchToken, SessionId, SessionKey, StreamEvent};

/// Identifier of one subscription within a session.
pub type SubscriberId = u64;

/// What a subscriber listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Binding {
    /// Events of one attachment, before its session id is known.
    Generic(LaunchToken),
    /// Every event of the session.
    Scoped(SessionId),
}

impl Binding {
    fn matches(&self, event: &StreamEvent) -> bool {
        match self {
            Self::Generic(token) => &event.launch_token == token,
            Self::Scoped(id) => event.session_id.as_ref() == Some(id),
        }
    }
}

impl From<SessionKey> for Binding {
    fn from(key: SessionKey) -> Self {
        match key {
            SessionKey::Token(token) => Self::Generic(token),
            SessionKey::Id(id) => Self::Scoped(id),
        }
    }
}

struct Subscriber {
    binding: Binding,
    sender: mpsc::UnboundedSender<StreamEvent>,
}

/// Subscriber list of one session. Owned by the session actor.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: HashMap<SubscriberId, Subscriber>,
    next_id: SubscriberId,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber and returns its id and event receiver.
    pub fn subscribe(
        &mut self,
        binding: Binding,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<StreamEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.next_id = self.next_id.saturating_add(1);
        let id = self.next_id;
        debug!(subscriber = id, binding = ?binding, "Subscriber added");
        self.subscribers.insert(id, Subscriber { binding, sender });
        (id, receiver)
    }

    /// Returns true if the subscriber existed.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Delivers `event` once to every matching subscriber. Returns how
    /// many received it.
    pub fn publish(&mut self, event: &StreamEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, subscriber) in &self.subscribers {
            if !subscriber.binding.matches(event) {
                continue;
            }
            if subscriber.sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(*id);
            }
        }

        for id in closed {
            trace!(subscriber = id, "Pruning closed subscriber");
            self.subscribers.remove(&id);
        }
        delivered
    }

    /// Moves every generic subscriber of `token` to the scoped channel.
    pub fn rebind(&mut self, token: &LaunchToken, session_id: &SessionId) -> usize {
        let mut moved = 0;
        for subscriber in self.subscribers.values_mut() {
            if matches!(&subscriber.binding, Binding::Generic(t) if t == token) {
                subscriber.binding = Binding::Scoped(session_id.clone());
                moved += 1;
            }
        }
        if moved > 0 {
            debug!(token = %token, session_id = %session_id, moved, "Rebound generic subscribers");
        }
        moved
    }

    /// Subscribers whose receiver is still open.
    pub fn live_count(&self) -> usize {
        self.subscribers
            .values()
            .filter(|s| !s.sender.is_closed())
            .count()
    }

    pub fn binding_of(&self, id: SubscriberId) -> Option<&Binding> {
        self.subscribers.get(&id).map(|s| &s.binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crew_core::EventKind;
    use serde_json::json;

    fn event(seq: u64, token: &str, session: Option<&str>) -> StreamEvent {
        StreamEvent {
            seq,
            launch_token: LaunchToken::new(token),
            session_id: session.map(SessionId::new),
            timestamp: Utc::now(),
            kind: EventKind::Record {
                record: json!({"seq": seq}),
            },
        }
    }

    #[test]
    fn test_generic_and_scoped_matching() {
        let mut broadcaster = Broadcaster::new();
        let (_, mut generic) = broadcaster.subscribe(Binding::Generic(LaunchToken::new("t1")));
        let (_, mut scoped) = broadcaster.subscribe(Binding::Scoped(SessionId::new("s1")));
        let (_, mut other) = broadcaster.subscribe(Binding::Generic(LaunchToken::new("t2")));

        assert_eq!(broadcaster.publish(&event(1, "t1", None)), 1);
        assert_eq!(broadcaster.publish(&event(2, "t1", Some("s1"))), 2);

        assert_eq!(generic.try_recv().unwrap().seq, 1);
        assert_eq!(generic.try_recv().unwrap().seq, 2);
        assert_eq!(scoped.try_recv().unwrap().seq, 2);
        assert!(scoped.try_recv().is_err());
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_rebind_delivers_exactly_once() {
        let mut broadcaster = Broadcaster::new();
        let (id, mut rx) = broadcaster.subscribe(Binding::Generic(LaunchToken::new("t1")));

        broadcaster.publish(&event(1, "t1", Some("s1")));
        assert_eq!(broadcaster.rebind(&LaunchToken::new("t1"), &SessionId::new("s1")), 1);
        assert_eq!(
            broadcaster.binding_of(id),
            Some(&Binding::Scoped(SessionId::new("s1")))
        );

        // Matches both the old token and the new session id.
        broadcaster.publish(&event(2, "t1", Some("s1")));
        // Later attachment of the same session.
        broadcaster.publish(&event(3, "t9", Some("s1")));

        let seqs: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let mut broadcaster = Broadcaster::new();
        let (_, rx) = broadcaster.subscribe(Binding::Scoped(SessionId::new("s1")));
        assert_eq!(broadcaster.live_count(), 1);
        drop(rx);
        assert_eq!(broadcaster.live_count(), 0);
        assert_eq!(broadcaster.publish(&event(1, "t1", Some("s1"))), 0);
        assert!(broadcaster.subscribers.is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let mut broadcaster = Broadcaster::new();
        let (id, _rx) = broadcaster.subscribe(Binding::Scoped(SessionId::new("s1")));
        assert!(broadcaster.unsubscribe(id));
        assert!(!broadcaster.unsubscribe(id));
    }
}
