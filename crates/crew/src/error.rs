//! Error types for the crew client.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;

use crew_protocol::ErrorCode;
use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors raised while talking to `crewd`.
///
/// Connection errors suggest checking that the daemon runs; `Daemon`
/// carries the daemon's own error message and code unchanged.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Failed to connect to the daemon.
    #[error("Failed to connect to daemon: {0}")]
    DaemonConnection(String),

    /// The client and daemon speak incompatible protocol versions.
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        /// The protocol version this client supports.
        client_version: String,
        /// The protocol version the daemon is running.
        daemon_version: String,
    },

    /// The daemon sent something this client did not expect.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The daemon refused a request.
    #[error("{message}")]
    Daemon {
        message: String,
        code: Option<ErrorCode>,
    },

    /// The daemon closed the connection.
    #[error("Connection closed by daemon")]
    ConnectionClosed,

    /// I/O error passthrough.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON parse error passthrough.
    #[error("Failed to parse message: {0}")]
    ParseError(#[from] serde_json::Error),
}

impl ClientError {
    /// Error code reported by the daemon, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Daemon { code, .. } => *code,
            _ => None,
        }
    }
}

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_connection_error_display() {
        let error = ClientError::DaemonConnection("refused".to_string());
        let display = format!("{error}");
        assert!(display.contains("Failed to connect to daemon"));
        assert!(display.contains("refused"));
    }

    #[test]
    fn test_version_mismatch_error_display() {
        let error = ClientError::VersionMismatch {
            client_version: "1.0".to_string(),
            daemon_version: "2.0".to_string(),
        };
        let display = format!("{error}");
        assert!(display.contains("client: 1.0"));
        assert!(display.contains("daemon: 2.0"));
    }

    #[test]
    fn test_daemon_error_keeps_message_and_code() {
        let error = ClientError::Daemon {
            message: "session is busy: abc".to_string(),
            code: Some(ErrorCode::SessionBusy),
        };
        assert_eq!(error.to_string(), "session is busy: abc");
        assert_eq!(error.code(), Some(ErrorCode::SessionBusy));
        assert_eq!(ClientError::ConnectionClosed.code(), None);
    }

    #[test]
    fn test_parse_error_from_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{ invalid json }").unwrap_err();
        let error: ClientError = json_error.into();
        assert!(matches!(error, ClientError::ParseError(_)));
    }
}
