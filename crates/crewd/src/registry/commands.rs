//! Session actor commands and registry errors.
//!
//! This module defines the message types for communicating with a `SessionActor`:
//! - `SessionCommand`: Requests from the registry handle and reports from the
//!   attachment supervisor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `Subscription`: What a subscriber gets back (backlog + live receiver)
//!
//! All types are designed for async message passing and follow the panic-free policy.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crew_core::{
    EnqueueOutcome, EventKind, LaunchOptions, LaunchToken, SessionId, SessionKey, SessionSummary,
    StreamEvent,
};
use crew_protocol::{AgentRecord, ErrorCode};

use super::broadcaster::{Binding, SubscriberId};
use crate::launcher::{ExitInfo, LaunchError};

// ============================================================================
// Session Commands
// ============================================================================

/// Commands sent to a session actor.
///
/// Requests carry a oneshot `respond_to`. Supervisor reports carry the
/// attachment `generation` they belong to; the actor drops reports from
/// attachments that are already finalized or superseded.
#[derive(Debug)]
pub enum SessionCommand {
    /// Append an event to the session stream.
    Append {
        kind: EventKind,
        respond_to: oneshot::Sender<Result<u64, RegistryError>>,
    },

    /// Bind the authoritative session id. Binds once; later calls return
    /// the id already bound.
    Announce {
        token: LaunchToken,
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<SessionId, RegistryError>>,
    },

    /// A decoded stdout record.
    Output { generation: u64, record: AgentRecord },

    /// A stderr line.
    Stderr { generation: u64, line: String },

    /// Reading stdout failed.
    StreamError { generation: u64, message: String },

    /// The attachment's process exited.
    Exited { generation: u64, exit: ExitInfo },

    /// The cancel grace period of an attachment ran out.
    GraceElapsed { generation: u64 },

    /// Cancel the live attachment.
    Cancel {
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Start a continuation attachment with `prompt`.
    ///
    /// # Errors
    /// - `RegistryError::SessionBusy` while a process is attached
    Continue {
        prompt: String,
        options: Option<LaunchOptions>,
        respond_to: oneshot::Sender<Result<LaunchToken, RegistryError>>,
    },

    /// Queue `prompt`, or run it right away when nothing is attached.
    Enqueue {
        prompt: String,
        respond_to: oneshot::Sender<Result<EnqueueOutcome, RegistryError>>,
    },

    /// Register a subscriber. The backlog is copied in the same step.
    Subscribe {
        binding: Binding,
        respond_to: oneshot::Sender<Subscription>,
    },

    /// Fire-and-forget subscriber removal.
    Unsubscribe { id: SubscriberId },

    GetSummary {
        respond_to: oneshot::Sender<SessionSummary>,
    },

    /// Cached events, all of them or those after a sequence number.
    GetOutput {
        after: Option<u64>,
        respond_to: oneshot::Sender<Vec<StreamEvent>>,
    },

    /// Whether the session may be dropped from the registry.
    Evictable {
        retention: Duration,
        respond_to: oneshot::Sender<bool>,
    },

    /// Kill any live process and stop the actor.
    Shutdown {
        respond_to: Option<oneshot::Sender<()>>,
    },
}

/// A registered subscriber.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    /// Effective binding; a generic request for an already announced
    /// attachment is upgraded to scoped.
    pub binding: Binding,
    /// Events cached before the subscription, oldest first.
    pub backlog: Vec<StreamEvent>,
    pub receiver: mpsc::UnboundedReceiver<StreamEvent>,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
///
/// Uses `thiserror` for ergonomic error handling and Display implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No session is known under this key.
    #[error("unknown session: {0}")]
    UnknownSession(SessionKey),

    /// The session already has a live process attached.
    #[error("session is busy: {0}")]
    SessionBusy(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The actor's channel closed before responding.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RegistryError {
    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownSession(_) => ErrorCode::UnknownSession,
            Self::SessionBusy(_) => ErrorCode::SessionBusy,
            Self::Launch(LaunchError::BinaryNotFound { .. }) => ErrorCode::BinaryNotFound,
            Self::Launch(LaunchError::SpawnFailed { .. }) => ErrorCode::SpawnFailed,
            Self::Launch(LaunchError::InvalidPath { .. }) => ErrorCode::InvalidPath,
            Self::ChannelClosed => ErrorCode::Internal,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
        }
    }

    pub fn invalid<S: Into<String>>(reason: S) -> Self {
        Self::InvalidRequest(reason.into())
    }
}
