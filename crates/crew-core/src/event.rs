//! Sequenced events carried on session streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::session::{LaunchToken, SessionId, SessionStatus};

/// One event of a session stream.
///
/// `seq` is assigned by the session when the event is appended to its
/// output cache. It starts at 1 and increases by exactly one per event,
/// across all process attachments of the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub seq: u64,

    /// Attachment that produced the event.
    pub launch_token: LaunchToken,

    /// Session id known at the time the event was appended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    pub timestamp: DateTime<Utc>,

    pub kind: EventKind,
}

impl StreamEvent {
    /// Returns true for the single completion event of an attachment.
    #[must_use]
    pub fn is_completion(&self) -> bool {
        matches!(self.kind, EventKind::Completed { .. })
    }

    /// Returns the session id carried by an announcement event.
    #[must_use]
    pub fn announced_session_id(&self) -> Option<&SessionId> {
        match &self.kind {
            EventKind::Announced { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

/// Payload of a stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// The agent announced the authoritative session id (`system/init`).
    Announced {
        session_id: SessionId,
        record: serde_json::Value,
    },

    /// Any other structured record from the agent, forwarded verbatim.
    Record { record: serde_json::Value },

    /// The agent reported the end of a turn (`type: "result"`).
    TurnResult { record: serde_json::Value },

    /// A line the agent wrote to stderr.
    Stderr { line: String },

    /// Reading the agent's output failed.
    StreamError { message: String },

    /// A follow-up prompt was queued behind the running turn.
    PromptQueued { order: u64, prompt: String },

    /// A queued or direct follow-up prompt started a new attachment.
    PromptStarted { order: Option<u64>, prompt: String },

    /// Cancellation was requested.
    Cancelling,

    /// The attachment finished. Exactly one per attachment.
    Completed {
        outcome: Outcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default)]
        dropped_prompts: usize,
    },
}

/// How an attachment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Exited with status 0.
    Success,

    /// Exited non-zero, was killed by a signal, or could not be awaited.
    Failed,

    /// Finished because of an explicit cancel.
    Cancelled,
}

impl Outcome {
    /// Terminal session status this outcome maps to.
    #[must_use]
    pub fn terminal_status(&self) -> SessionStatus {
        match self {
            Self::Success | Self::Cancelled => SessionStatus::Completed,
            Self::Failed => SessionStatus::Failed,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
