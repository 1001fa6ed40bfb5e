//! Protocol message types for daemon communication.
//!
//! Every message is one JSON object per line. Requests carry the client's
//! protocol version; responses and pushed stream events are tagged with
//! `type`.

use crate::version::ProtocolVersion;
use crew_core::{
    EnqueueOutcome, LaunchOptions, LaunchToken, SessionId, SessionKey, SessionSummary,
    StoredProject, StoredSession, StreamEvent,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Requests a client can send to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Spawn a fresh agent in a project
    StartSession {
        project_path: String,
        prompt: String,
        #[serde(default)]
        options: LaunchOptions,
    },

    /// Follow-up prompt on a tracked session
    ContinueSession { session_id: SessionId, prompt: String },

    /// Reattach to a stored conversation
    ResumeSession {
        session_id: SessionId,
        prompt: String,
        /// Required when the daemon does not track the session
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<LaunchOptions>,
    },

    /// Cancel the live attachment of a session
    CancelSession { session_id: SessionId },

    /// Queue a prompt behind the running turn
    EnqueuePrompt { session_id: SessionId, prompt: String },

    /// List sessions (non-terminal only unless `all`)
    ListSessions {
        #[serde(default)]
        all: bool,
    },

    /// Summary of one session
    GetSession { key: SessionKey },

    /// Cached output of a session
    GetOutput {
        session_id: SessionId,
        /// Only events with a greater sequence number
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<u64>,
    },

    /// Start receiving events for a launch token or session id
    Subscribe { key: SessionKey },

    /// Stop receiving events for a key
    Unsubscribe { key: SessionKey },

    /// Projects in the agent's store
    ListProjects,

    /// Stored conversations of a project
    ListProjectSessions { project_id: String },

    /// Raw records of a stored conversation
    ReadTranscript {
        project_id: String,
        session_id: String,
    },

    /// Ping to check connection
    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,
}

impl MessageType {
    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::StartSession { .. } => "start_session",
            Self::ContinueSession { .. } => "continue_session",
            Self::ResumeSession { .. } => "resume_session",
            Self::CancelSession { .. } => "cancel_session",
            Self::EnqueuePrompt { .. } => "enqueue_prompt",
            Self::ListSessions { .. } => "list_sessions",
            Self::GetSession { .. } => "get_session",
            Self::GetOutput { .. } => "get_output",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::ListProjects => "list_projects",
            Self::ListProjectSessions { .. } => "list_project_sessions",
            Self::ReadTranscript { .. } => "read_transcript",
            Self::Ping { .. } => "ping",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Wraps a request with the current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn start_session(
        project_path: impl Into<String>,
        prompt: impl Into<String>,
        options: LaunchOptions,
    ) -> Self {
        Self::new(MessageType::StartSession {
            project_path: project_path.into(),
            prompt: prompt.into(),
            options,
        })
    }

    pub fn continue_session(session_id: SessionId, prompt: impl Into<String>) -> Self {
        Self::new(MessageType::ContinueSession {
            session_id,
            prompt: prompt.into(),
        })
    }

    pub fn resume_session(
        session_id: SessionId,
        prompt: impl Into<String>,
        project_path: Option<String>,
        options: Option<LaunchOptions>,
    ) -> Self {
        Self::new(MessageType::ResumeSession {
            session_id,
            prompt: prompt.into(),
            project_path,
            options,
        })
    }

    pub fn cancel_session(session_id: SessionId) -> Self {
        Self::new(MessageType::CancelSession { session_id })
    }

    pub fn enqueue_prompt(session_id: SessionId, prompt: impl Into<String>) -> Self {
        Self::new(MessageType::EnqueuePrompt {
            session_id,
            prompt: prompt.into(),
        })
    }

    pub fn list_sessions(all: bool) -> Self {
        Self::new(MessageType::ListSessions { all })
    }

    pub fn get_session(key: SessionKey) -> Self {
        Self::new(MessageType::GetSession { key })
    }

    pub fn get_output(session_id: SessionId, after: Option<u64>) -> Self {
        Self::new(MessageType::GetOutput { session_id, after })
    }

    pub fn subscribe(key: SessionKey) -> Self {
        Self::new(MessageType::Subscribe { key })
    }

    pub fn unsubscribe(key: SessionKey) -> Self {
        Self::new(MessageType::Unsubscribe { key })
    }

    pub fn list_projects() -> Self {
        Self::new(MessageType::ListProjects)
    }

    pub fn list_project_sessions(project_id: impl Into<String>) -> Self {
        Self::new(MessageType::ListProjectSessions {
            project_id: project_id.into(),
        })
    }

    pub fn read_transcript(project_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::new(MessageType::ReadTranscript {
            project_id: project_id.into(),
            session_id: session_id.into(),
        })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Machine-readable error category carried in [`DaemonMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownSession,
    SessionBusy,
    BinaryNotFound,
    SpawnFailed,
    InvalidPath,
    InvalidRequest,
    NotFound,
    VersionMismatch,
    NotConnected,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnknownSession => "unknown_session",
            Self::SessionBusy => "session_busy",
            Self::BinaryNotFound => "binary_not_found",
            Self::SpawnFailed => "spawn_failed",
            Self::InvalidPath => "invalid_path",
            Self::InvalidRequest => "invalid_request",
            Self::NotFound => "not_found",
            Self::VersionMismatch => "version_mismatch",
            Self::NotConnected => "not_connected",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// A process attachment was spawned
    Launched {
        launch_token: LaunchToken,
        /// Known up front for continue/resume
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    /// Request accepted, nothing to return
    Ack,

    /// Result of an enqueue request
    Enqueued { outcome: EnqueueOutcome },

    /// Session list response
    SessionList { sessions: Vec<SessionSummary> },

    /// One session summary
    Session { session: Box<SessionSummary> },

    /// Cached output response
    Output {
        session_id: SessionId,
        events: Vec<StreamEvent>,
    },

    /// Subscription registered; `backlog` holds what was cached for it
    Subscribed {
        key: SessionKey,
        backlog: Vec<StreamEvent>,
    },

    /// Subscription removed
    Unsubscribed { key: SessionKey },

    /// Live event pushed to a subscriber
    Event { event: Box<StreamEvent> },

    /// Stored projects
    Projects { projects: Vec<StoredProject> },

    /// Stored conversations of one project
    ProjectSessions { sessions: Vec<StoredSession> },

    /// Raw transcript records
    Transcript { records: Vec<serde_json::Value> },

    /// Pong response to ping
    Pong { seq: u64 },

    /// Error response
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn launched(launch_token: LaunchToken, session_id: Option<SessionId>) -> Self {
        Self::Launched {
            launch_token,
            session_id,
        }
    }

    pub fn session_list(sessions: Vec<SessionSummary>) -> Self {
        Self::SessionList { sessions }
    }

    pub fn session(session: SessionSummary) -> Self {
        Self::Session {
            session: Box::new(session),
        }
    }

    pub fn event(event: StreamEvent) -> Self {
        Self::Event {
            event: Box::new(event),
        }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: ErrorCode) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code),
        }
    }

    /// True for pushed stream events, as opposed to request responses.
    pub fn is_event(&self) -> bool {
        matches!(self, Self::Event { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crew_core::EventKind;

    #[test]
    fn test_client_message_serialization() {
        let msg = ClientMessage::ping(42);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ping\""));
        assert!(json.contains("\"seq\":42"));
        assert!(json.contains("\"protocol_version\":{\"major\":1,\"minor\":0}"));
    }

    #[test]
    fn test_start_session_defaults_options() {
        let json = r#"{"protocol_version":{"major":1,"minor":0},"type":"start_session","project_path":"/tmp/p","prompt":"hi"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        match parsed.message {
            MessageType::StartSession { options, .. } => {
                assert_eq!(options, LaunchOptions::default());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_subscribe_roundtrip() {
        let original = ClientMessage::subscribe(SessionKey::Token(LaunchToken::new("launch-1")));
        let json = serde_json::to_string(&original).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed.message {
            MessageType::Subscribe { key } => {
                assert_eq!(key, SessionKey::Token(LaunchToken::new("launch-1")));
            }
            other => panic!("expected subscribe, got {other:?}"),
        }
    }

    #[test]
    fn test_event_message_shape() {
        let msg = DaemonMessage::event(StreamEvent {
            seq: 7,
            launch_token: LaunchToken::new("launch-1"),
            session_id: Some(SessionId::new("s")),
            timestamp: Utc::now(),
            kind: EventKind::Cancelling,
        });
        assert!(msg.is_event());
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"]["seq"], 7);
        assert_eq!(value["event"]["kind"]["kind"], "cancelling");
    }

    #[test]
    fn test_error_code_serialization() {
        let msg = DaemonMessage::error_with_code("no such session", ErrorCode::UnknownSession);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"code\":\"unknown_session\""));
        assert_eq!(ErrorCode::SessionBusy.to_string(), "session_busy");
    }
}
