//! Session identifiers, lifecycle status and summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DomainError, DomainResult};
use crate::project::ProjectRef;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Authoritative identifier of an agent conversation.
///
/// Announced by the agent process in its `system/init` record, so it is
/// unknown while the process is starting up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string.
    ///
    /// Note: This does not validate the format. The agent provides
    /// the session_id, so we trust it; use [`SessionId::parse`] for
    /// ids coming from clients.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parses a client supplied id, rejecting anything that could be used
    /// to escape the agent's session store.
    pub fn parse(id: &str) -> DomainResult<Self> {
        if is_safe_id(id) {
            Ok(Self(id.to_string()))
        } else {
            Err(DomainError::InvalidSessionId(id.to_string()))
        }
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Prefix used for launch tokens.
pub const LAUNCH_TOKEN_PREFIX: &str = "launch-";

/// Ephemeral identifier assigned to a process attachment at spawn time.
///
/// Consumers use it to listen on the generic channel before the
/// session id has been announced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaunchToken(String);

impl LaunchToken {
    /// Generates a fresh, globally unique token.
    pub fn generate() -> Self {
        Self(format!("{LAUNCH_TOKEN_PREFIX}{}", uuid::Uuid::new_v4().simple()))
    }

    /// Wraps an existing token string (e.g. one received over the wire).
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form without the prefix.
    #[must_use]
    pub fn short(&self) -> &str {
        let bare = self.0.strip_prefix(LAUNCH_TOKEN_PREFIX).unwrap_or(&self.0);
        bare.get(..8).unwrap_or(bare)
    }
}

impl fmt::Display for LaunchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key used to address a session in the registry.
///
/// Before the announcement only the launch token is known; afterwards
/// both keys resolve to the same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum SessionKey {
    Token(LaunchToken),
    Id(SessionId),
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(token) => write!(f, "{token}"),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

impl From<LaunchToken> for SessionKey {
    fn from(token: LaunchToken) -> Self {
        Self::Token(token)
    }
}

impl From<SessionId> for SessionKey {
    fn from(id: SessionId) -> Self {
        Self::Id(id)
    }
}

/// Returns true if `value` is usable as a single path component.
///
/// Rejects empty values, `..` sequences and both separator styles.
pub fn is_safe_id(value: &str) -> bool {
    !value.is_empty() && !value.contains("..") && !value.contains('/') && !value.contains('\\')
}

// ============================================================================
// Session Status
// ============================================================================

/// Lifecycle status of a session.
///
/// ```text
/// Starting ─▶ Running ─▶ Idle ─▶ Completed | Failed
///     │          │         ▲
///     └──────────┴─▶ Cancelling ─▶ Completed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Process spawned, nothing parsed yet.
    #[default]
    Starting,

    /// Agent is streaming output.
    Running,

    /// Turn finished; waiting for a follow-up prompt.
    Idle,

    /// Kill requested, waiting for exit or the grace period.
    Cancelling,

    /// Process finished (or was cancelled) cleanly.
    Completed,

    /// Process exited abnormally.
    Failed,
}

impl SessionStatus {
    /// Returns the display label for this status.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Session Summary
// ============================================================================

/// Read-only snapshot of a session, as returned by list operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Announced session id, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    /// Token of the current (or last) process attachment.
    pub launch_token: LaunchToken,

    /// Project the agent runs in.
    pub project: ProjectRef,

    pub status: SessionStatus,

    /// Number of process attachments so far (1 for a fresh session).
    pub generation: u64,

    /// PID of the attached process while it is alive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Exit code of the last attachment that exited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Prompts waiting to run after the current turn.
    pub pending_prompts: usize,

    /// Sequence number of the newest cached event (0 if none).
    pub last_seq: u64,

    /// Number of live subscribers.
    pub subscribers: usize,

    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl SessionSummary {
    /// Session id if announced, otherwise the launch token.
    #[must_use]
    pub fn display_id(&self) -> String {
        match &self.session_id {
            Some(id) => id.to_string(),
            None => self.launch_token.to_string(),
        }
    }

    /// Returns the key that best addresses this session.
    #[must_use]
    pub fn key(&self) -> SessionKey {
        match &self.session_id {
            Some(id) => SessionKey::Id(id.clone()),
            None => SessionKey::Token(self.launch_token.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_short() {
        let id = SessionId::new("8e11bfb5-7dc2-432b-9206-928fa5c35731");
        assert_eq!(id.short(), "8e11bfb5");
        assert_eq!(SessionId::new("abc").short(), "abc");
    }

    #[test]
    fn test_session_id_parse_rejects_traversal() {
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("../x").is_err());
        assert!(SessionId::parse("a/../b").is_err());
        assert!(SessionId::parse("a/b").is_err());
        assert!(SessionId::parse("a\\b").is_err());
        assert!(SessionId::parse("abc-123_DEF").is_ok());
    }

    #[test]
    fn test_launch_tokens_are_unique() {
        let a = LaunchToken::generate();
        let b = LaunchToken::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(LAUNCH_TOKEN_PREFIX));
        assert_eq!(a.short().len(), 8);
    }

    #[test]
    fn test_status_classification() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Idle.is_terminal());
        assert_eq!(SessionStatus::default(), SessionStatus::Starting);
    }

    #[test]
    fn test_session_key_serialization() {
        let key = SessionKey::Id(SessionId::new("abc"));
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json, serde_json::json!({"by": "id", "value": "abc"}));

        let parsed: SessionKey =
            serde_json::from_value(serde_json::json!({"by": "token", "value": "launch-1"}))
                .unwrap();
        assert_eq!(parsed, SessionKey::Token(LaunchToken::new("launch-1")));
    }
}
