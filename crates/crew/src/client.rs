//! Daemon connection client for `crew`.
//!
//! This module provides the `DaemonClient` which handles:
//! - Connection to the daemon via Unix socket, with exponential backoff
//! - The `Connect` handshake and protocol version check
//! - Typed request/response helpers over the JSON-lines protocol
//! - Buffering of pushed events that arrive while a request is in flight
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crew_core::{
    EnqueueOutcome, LaunchOptions, LaunchToken, SessionId, SessionKey, SessionSummary,
    StoredProject, StoredSession, StreamEvent,
};
use crew_protocol::{ClientMessage, DaemonMessage, ProtocolVersion};

use crate::error::{ClientError, Result};

/// Default socket path, shared with `crewd`.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/crew.sock";

/// Environment variable overriding the socket path.
pub const ENV_SOCKET: &str = "CREW_SOCKET";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the daemon client.
///
/// # Example
///
/// ```rust
/// use crew_client::client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     socket_path: std::path::PathBuf::from("/tmp/my-crew.sock"),
///     retry_initial_delay: Duration::from_millis(50),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the Unix socket where the daemon listens.
    pub socket_path: PathBuf,

    /// Initial delay before first retry after connection failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub retry_multiplier: f64,

    /// Connection attempts before giving up.
    pub max_attempts: u32,

    /// Id announced in the handshake; the daemon assigns one if `None`.
    pub client_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            retry_initial_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(2),
            retry_multiplier: 2.0,
            max_attempts: 5,
            client_id: None,
        }
    }
}

impl ClientConfig {
    /// Default configuration with `CREW_SOCKET` applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(ENV_SOCKET).filter(|p| !p.is_empty()) {
            config.socket_path = PathBuf::from(path);
        }
        config
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }
}

/// Next backoff delay, capped at `max`.
fn next_delay(delay: Duration, multiplier: f64, max: Duration) -> Duration {
    let next_ms = (delay.as_millis() as f64 * multiplier) as u64;
    Duration::from_millis(next_ms).min(max)
}

// ============================================================================
// Daemon Client
// ============================================================================

/// A connected, handshaken session with `crewd`.
///
/// # Connection Lifecycle
///
/// 1. Connect to the Unix socket, retrying with exponential backoff
/// 2. Send `Connect` and wait for `Connected`
/// 3. Exchange requests and responses; events pushed for subscriptions
///    are queued and handed out by [`DaemonClient::next_event`]
/// 4. Send `Disconnect` on the way out
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,

    /// Events received while waiting for a response.
    pending: VecDeque<StreamEvent>,
}

impl DaemonClient {
    /// Connects and performs the handshake.
    ///
    /// # Errors
    ///
    /// - `ClientError::DaemonConnection` if the socket stays unreachable
    /// - `ClientError::VersionMismatch` if the daemon rejects our version
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let stream = connect_with_retry(config).await?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
            pending: VecDeque::new(),
        };
        client.handshake(config.client_id.clone()).await?;
        Ok(client)
    }

    /// Id the daemon knows this connection by.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn handshake(&mut self, client_id: Option<String>) -> Result<()> {
        self.send(&ClientMessage::connect(client_id)).await?;

        match self.recv().await? {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                debug!(
                    client_id,
                    protocol_version = %protocol_version,
                    "Handshake complete"
                );
                self.client_id = client_id;
                Ok(())
            }
            DaemonMessage::Rejected {
                protocol_version, ..
            } => Err(ClientError::VersionMismatch {
                client_version: ProtocolVersion::CURRENT.to_string(),
                daemon_version: protocol_version.to_string(),
            }),
            DaemonMessage::Error { message, code } => Err(ClientError::Daemon { message, code }),
            other => Err(unexpected("connect", &other)),
        }
    }

    /// Serializes `message` and writes it as one line.
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        debug!(message_type = message.message.name(), "Sent message to daemon");
        Ok(())
    }

    /// Reads one message.
    async fn recv(&mut self) -> Result<DaemonMessage> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(trimmed)?);
        }
    }

    /// Sends a request and returns its response.
    ///
    /// Events that arrive first are queued for [`DaemonClient::next_event`].
    /// A daemon `Error` becomes `ClientError::Daemon`.
    pub async fn request(&mut self, message: ClientMessage) -> Result<DaemonMessage> {
        self.send(&message).await?;
        loop {
            match self.recv().await? {
                DaemonMessage::Event { event } => self.pending.push_back(*event),
                DaemonMessage::Error { message, code } => {
                    return Err(ClientError::Daemon { message, code })
                }
                response => return Ok(response),
            }
        }
    }

    /// Next event pushed by a subscription.
    pub async fn next_event(&mut self) -> Result<StreamEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        loop {
            match self.recv().await? {
                DaemonMessage::Event { event } => return Ok(*event),
                DaemonMessage::Error { message, code } => {
                    return Err(ClientError::Daemon { message, code })
                }
                other => warn!(message = ?other, "Ignoring unsolicited daemon message"),
            }
        }
    }

    /// Says goodbye and closes the connection.
    pub async fn disconnect(mut self) -> Result<()> {
        self.send(&ClientMessage::disconnect()).await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    pub async fn start_session(
        &mut self,
        project_path: &str,
        prompt: &str,
        options: LaunchOptions,
    ) -> Result<LaunchToken> {
        let msg = ClientMessage::start_session(project_path, prompt, options);
        self.launched("start_session", msg).await
    }

    pub async fn continue_session(
        &mut self,
        session_id: &SessionId,
        prompt: &str,
    ) -> Result<LaunchToken> {
        let msg = ClientMessage::continue_session(session_id.clone(), prompt);
        self.launched("continue_session", msg).await
    }

    /// Resumes a stored conversation; `project_path` is required when the
    /// daemon does not track it.
    pub async fn resume_session(
        &mut self,
        session_id: &SessionId,
        prompt: &str,
        project_path: Option<String>,
        options: Option<LaunchOptions>,
    ) -> Result<LaunchToken> {
        let msg = ClientMessage::resume_session(session_id.clone(), prompt, project_path, options);
        self.launched("resume_session", msg).await
    }

    async fn launched(&mut self, what: &str, msg: ClientMessage) -> Result<LaunchToken> {
        match self.request(msg).await? {
            DaemonMessage::Launched { launch_token, .. } => Ok(launch_token),
            other => Err(unexpected(what, &other)),
        }
    }

    pub async fn cancel_session(&mut self, session_id: &SessionId) -> Result<()> {
        match self
            .request(ClientMessage::cancel_session(session_id.clone()))
            .await?
        {
            DaemonMessage::Ack => Ok(()),
            other => Err(unexpected("cancel_session", &other)),
        }
    }

    pub async fn enqueue_prompt(
        &mut self,
        session_id: &SessionId,
        prompt: &str,
    ) -> Result<EnqueueOutcome> {
        match self
            .request(ClientMessage::enqueue_prompt(session_id.clone(), prompt))
            .await?
        {
            DaemonMessage::Enqueued { outcome } => Ok(outcome),
            other => Err(unexpected("enqueue_prompt", &other)),
        }
    }

    pub async fn list_sessions(&mut self, all: bool) -> Result<Vec<SessionSummary>> {
        match self.request(ClientMessage::list_sessions(all)).await? {
            DaemonMessage::SessionList { sessions } => Ok(sessions),
            other => Err(unexpected("list_sessions", &other)),
        }
    }

    pub async fn get_session(&mut self, key: SessionKey) -> Result<SessionSummary> {
        match self.request(ClientMessage::get_session(key)).await? {
            DaemonMessage::Session { session } => Ok(*session),
            other => Err(unexpected("get_session", &other)),
        }
    }

    pub async fn get_output(
        &mut self,
        session_id: &SessionId,
        after: Option<u64>,
    ) -> Result<Vec<StreamEvent>> {
        match self
            .request(ClientMessage::get_output(session_id.clone(), after))
            .await?
        {
            DaemonMessage::Output { events, .. } => Ok(events),
            other => Err(unexpected("get_output", &other)),
        }
    }

    /// Subscribes and returns the backlog cached for `key`.
    pub async fn subscribe(&mut self, key: SessionKey) -> Result<Vec<StreamEvent>> {
        match self.request(ClientMessage::subscribe(key)).await? {
            DaemonMessage::Subscribed { backlog, .. } => Ok(backlog),
            other => Err(unexpected("subscribe", &other)),
        }
    }

    pub async fn unsubscribe(&mut self, key: SessionKey) -> Result<()> {
        match self.request(ClientMessage::unsubscribe(key)).await? {
            DaemonMessage::Unsubscribed { .. } => Ok(()),
            other => Err(unexpected("unsubscribe", &other)),
        }
    }

    // ------------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------------

    pub async fn list_projects(&mut self) -> Result<Vec<StoredProject>> {
        match self.request(ClientMessage::list_projects()).await? {
            DaemonMessage::Projects { projects } => Ok(projects),
            other => Err(unexpected("list_projects", &other)),
        }
    }

    pub async fn list_project_sessions(&mut self, project_id: &str) -> Result<Vec<StoredSession>> {
        match self
            .request(ClientMessage::list_project_sessions(project_id))
            .await?
        {
            DaemonMessage::ProjectSessions { sessions } => Ok(sessions),
            other => Err(unexpected("list_project_sessions", &other)),
        }
    }

    pub async fn read_transcript(
        &mut self,
        project_id: &str,
        session_id: &str,
    ) -> Result<Vec<serde_json::Value>> {
        match self
            .request(ClientMessage::read_transcript(project_id, session_id))
            .await?
        {
            DaemonMessage::Transcript { records } => Ok(records),
            other => Err(unexpected("read_transcript", &other)),
        }
    }

    pub async fn ping(&mut self, seq: u64) -> Result<()> {
        match self.request(ClientMessage::ping(seq)).await? {
            DaemonMessage::Pong { seq: got } if got == seq => Ok(()),
            other => Err(unexpected("ping", &other)),
        }
    }
}

fn unexpected(what: &str, response: &DaemonMessage) -> ClientError {
    ClientError::ProtocolError(format!("Unexpected response to {what}: {response:?}"))
}

/// Connects to the daemon socket with exponential backoff.
async fn connect_with_retry(config: &ClientConfig) -> Result<UnixStream> {
    let mut delay = config.retry_initial_delay;
    let attempts = config.max_attempts.max(1);
    let mut last_error = String::from("socket not found");

    for attempt in 1..=attempts {
        debug!(
            attempt,
            socket_path = %config.socket_path.display(),
            "Attempting to connect to daemon"
        );

        if config.socket_path.exists() {
            match UnixStream::connect(&config.socket_path).await {
                Ok(stream) => {
                    debug!(attempt, "Connection successful");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Connection attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        if attempt < attempts {
            sleep(delay).await;
            delay = next_delay(delay, config.retry_multiplier, config.retry_max_delay);
        }
    }

    info!(socket_path = %config.socket_path.display(), "Daemon unreachable");
    Err(ClientError::DaemonConnection(format!(
        "{} ({last_error}); is crewd running? Start it with 'crewd start -d'",
        config.socket_path.display()
    )))
}
