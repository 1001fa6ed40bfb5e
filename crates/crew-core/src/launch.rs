//! Launch intents and options shared by the daemon and its clients.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::session::SessionId;

/// How a process attachment relates to prior conversation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", content = "session_id", rename_all = "snake_case")]
pub enum Intent {
    /// Fresh conversation.
    New,

    /// Continue the most recent conversation in the project.
    Continue,

    /// Reattach to a specific stored conversation.
    Resume(SessionId),
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Continue => write!(f, "continue"),
            Self::Resume(id) => write!(f, "resume({id})"),
        }
    }
}

/// Per-launch knobs passed through to the agent CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchOptions {
    /// Model name forwarded as `--model`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Adds `--dangerously-skip-permissions`.
    pub skip_permissions: bool,

    /// Appended verbatim after the standard arguments (mode selectors etc).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,

    /// Leave the session `Idle` instead of `Completed` after a clean exit.
    pub keep_open: bool,
}

impl LaunchOptions {
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn keep_open(mut self, keep_open: bool) -> Self {
        self.keep_open = keep_open;
        self
    }
}
