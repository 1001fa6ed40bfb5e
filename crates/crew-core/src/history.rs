//! Records describing conversations stored by the agent on disk.
//!
//! The agent keeps one directory per project under its projects store and
//! one `<session-id>.jsonl` transcript per conversation. These types are the
//! read-only view handed to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A project directory in the agent's store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProject {
    /// Directory name, as written by the agent.
    pub id: String,

    /// Working directory recovered from the transcripts.
    pub path: String,

    /// Ids of the stored conversations.
    pub sessions: Vec<String>,

    pub created_at: DateTime<Utc>,

    /// Modification time of the newest transcript.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub most_recent_session: Option<DateTime<Utc>>,
}

/// One stored conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: String,
    pub project_id: String,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,

    /// First prompt typed by the user, ignoring CLI boilerplate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_timestamp: Option<String>,
}
