//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Project path rejected before any process is spawned
    #[error("Invalid project path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Project id that does not decode back to a path
    #[error("Invalid project id {id:?}: {reason}")]
    InvalidProjectId { id: String, reason: String },

    /// Session id that is empty or could escape a directory
    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),
}

impl DomainError {
    pub(crate) fn invalid_path(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_project_id(id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidProjectId {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
