//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages
//! - Routes commands to the registry and the history reader
//! - Forwards stream events of the sessions the client subscribed to
//!
//! A subscription answers with `Subscribed { backlog }` first; live events
//! follow as `Event` lines written by a forwarder task, so the backlog always
//! precedes them on the socket.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crew_core::{ProjectRef, SessionKey, StreamEvent};
use crew_protocol::{ClientMessage, DaemonMessage, ErrorCode, MessageType, ProtocolVersion};

use crate::history::{self, HistoryError};
use crate::launcher::LaunchError;
use crate::registry::{RegistryError, RegistryHandle, SessionHandle, SubscriberId};

/// Write half shared between the handler and its forwarder tasks
pub type ConnectionWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unique identifier for this connection
type ClientId = String;

/// One live subscription of this client.
struct ActiveSubscription {
    session: SessionHandle,
    id: SubscriberId,
    forwarder: JoinHandle<()>,
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Failure of a single request; reported to the client, never fatal.
#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("{0}")]
    Unavailable(String),
}

impl RequestError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::Registry(e) => e.code(),
            Self::History(HistoryError::UnsafeId { .. }) => ErrorCode::InvalidRequest,
            Self::History(HistoryError::NotFound(_)) => ErrorCode::NotFound,
            Self::History(HistoryError::Io { .. }) => ErrorCode::Internal,
            Self::Unavailable(_) => ErrorCode::Internal,
        }
    }
}

/// Connection handler for a single client.
///
/// Manages the lifecycle of a client connection including:
/// - Protocol handshake
/// - Message processing loop
/// - Per-session event subscriptions
/// - Graceful shutdown
pub struct ConnectionHandler {
    /// Buffered reader for incoming messages
    reader: BufReader<OwnedReadHalf>,

    /// Buffered writer for outgoing messages (shared with forwarders)
    writer: ConnectionWriter,

    /// Handle to the session registry
    registry: RegistryHandle,

    /// Agent conversation store, if a home directory exists
    projects_root: Option<PathBuf>,

    /// Unique client identifier (assigned after handshake)
    client_id: Option<ClientId>,

    /// Subscriptions keyed by the key the client subscribed with
    subscriptions: HashMap<SessionKey, ActiveSubscription>,

    connection_number: u64,
}

impl ConnectionHandler {
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `reader` - Read half of the Unix stream
    /// * `writer` - Write half of the Unix stream
    /// * `registry` - Handle to the session registry
    /// * `projects_root` - Agent conversation store for history requests
    /// * `connection_number` - Unique number for this connection
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        registry: RegistryHandle,
        projects_root: Option<PathBuf>,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            registry,
            projects_root,
            client_id: None,
            subscriptions: HashMap::new(),
            connection_number,
        }
    }

    /// Runs the connection handler.
    ///
    /// Performs the handshake, then processes messages until the
    /// connection closes. Subscriptions end with the connection.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                info!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return None;
            }
        }

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        self.drop_subscriptions().await;
        info!(client_id = ?self.client_id, "Client disconnected");
        self.client_id.take()
    }

    /// Expects a `Connect` message, validates the protocol version and
    /// responds with `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

        let client_version = msg.protocol_version;
        if let Err(e) = ProtocolVersion::check_peer(&client_version) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(DaemonMessage::rejected(&e.to_string()))
                .await?;
            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id))
                    .await
            }
            other => {
                self.send_message(DaemonMessage::error_with_code(
                    "Expected Connect message for handshake",
                    ErrorCode::NotConnected,
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(other.name().to_string()))
            }
        }
    }

    /// Reads and processes messages until the connection closes or an
    /// unrecoverable error occurs.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(e))) => {
                    // A bad line does not end the connection.
                    self.send_message(DaemonMessage::error_with_code(
                        &format!("Invalid message: {e}"),
                        ErrorCode::InvalidRequest,
                    ))
                    .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    // Subscribed clients legitimately stay silent.
                    if self.subscriptions.is_empty() {
                        debug!(client_id = ?self.client_id, "Connection timed out");
                        return Err(ConnectionError::Timeout);
                    }
                    continue;
                }
            };

            if matches!(msg.message, MessageType::Disconnect) {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Ok(());
            }

            let request = msg.message.name();
            let result = match msg.message {
                // Subscribe writes its own response.
                MessageType::Subscribe { key } => self.subscribe(key).await.map(|()| None),
                other => self.handle_message(other).await.map(Some),
            };
            let response = match result {
                Ok(Some(response)) => response,
                Ok(None) => continue,
                Err(e) => {
                    debug!(
                        client_id = ?self.client_id,
                        request,
                        error = %e,
                        "Request failed"
                    );
                    DaemonMessage::error_with_code(&e.to_string(), e.code())
                }
            };
            self.send_message(response).await?;
        }
    }

    /// Handles a single request and builds its response.
    async fn handle_message(
        &mut self,
        message: MessageType,
    ) -> Result<DaemonMessage, RequestError> {
        match message {
            MessageType::Connect { .. } => Ok(DaemonMessage::error_with_code(
                "Already connected",
                ErrorCode::InvalidRequest,
            )),

            MessageType::StartSession {
                project_path,
                prompt,
                options,
            } => {
                let project = project_ref(project_path)?;
                let token = self
                    .registry
                    .start_session(project, &prompt, options)
                    .await?;
                Ok(DaemonMessage::launched(token, None))
            }

            MessageType::ContinueSession { session_id, prompt } => {
                let token = self.registry.continue_session(&session_id, &prompt).await?;
                Ok(DaemonMessage::launched(token, Some(session_id)))
            }

            MessageType::ResumeSession {
                session_id,
                prompt,
                project_path,
                options,
            } => {
                let project = project_path.map(project_ref).transpose()?;
                let token = self
                    .registry
                    .resume_session(&session_id, &prompt, project, options)
                    .await?;
                Ok(DaemonMessage::launched(token, Some(session_id)))
            }

            MessageType::CancelSession { session_id } => {
                self.registry
                    .cancel_session(&SessionKey::Id(session_id))
                    .await?;
                Ok(DaemonMessage::Ack)
            }

            MessageType::EnqueuePrompt { session_id, prompt } => {
                let outcome = self
                    .registry
                    .enqueue_prompt(&SessionKey::Id(session_id), &prompt)
                    .await?;
                Ok(DaemonMessage::Enqueued { outcome })
            }

            MessageType::ListSessions { all } => {
                let sessions = if all {
                    self.registry.list_all().await
                } else {
                    self.registry.list_running().await
                };
                Ok(DaemonMessage::session_list(sessions))
            }

            MessageType::GetSession { key } => {
                let session = self.registry.get_session(&key).await?;
                Ok(DaemonMessage::session(session))
            }

            MessageType::GetOutput { session_id, after } => {
                let events = self
                    .registry
                    .get_cached_output(&SessionKey::Id(session_id.clone()), after)
                    .await?;
                Ok(DaemonMessage::Output { session_id, events })
            }

            MessageType::Unsubscribe { key } => {
                if let Some(active) = self.subscriptions.remove(&key) {
                    active.session.unsubscribe(active.id).await;
                    debug!(client_id = ?self.client_id, key = %key, "Client unsubscribed");
                }
                Ok(DaemonMessage::Unsubscribed { key })
            }

            MessageType::ListProjects => {
                let root = self.projects_root()?;
                let projects = blocking(move || history::list_projects(&root)).await?;
                Ok(DaemonMessage::Projects { projects })
            }

            MessageType::ListProjectSessions { project_id } => {
                let root = self.projects_root()?;
                let sessions =
                    blocking(move || history::list_project_sessions(&root, &project_id)).await?;
                Ok(DaemonMessage::ProjectSessions { sessions })
            }

            MessageType::ReadTranscript {
                project_id,
                session_id,
            } => {
                let root = self.projects_root()?;
                let records = blocking(move || {
                    history::read_session_transcript(&root, &project_id, &session_id)
                })
                .await?;
                Ok(DaemonMessage::Transcript { records })
            }

            MessageType::Ping { seq } => Ok(DaemonMessage::pong(seq)),

            // Handled by the read loop.
            MessageType::Subscribe { .. } | MessageType::Disconnect => Ok(DaemonMessage::Ack),
        }
    }

    /// Registers with the session, answers with the backlog, then starts
    /// forwarding live events.
    async fn subscribe(&mut self, key: SessionKey) -> Result<(), RequestError> {
        if let Some(previous) = self.subscriptions.remove(&key) {
            previous.session.unsubscribe(previous.id).await;
        }

        let (session, subscription) = self.registry.subscribe(key.clone()).await?;
        debug!(
            client_id = ?self.client_id,
            key = %key,
            subscriber = subscription.id,
            binding = ?subscription.binding,
            backlog = subscription.backlog.len(),
            "Client subscribed"
        );

        // Must hit the socket before the forwarder starts.
        let response = DaemonMessage::Subscribed {
            key: key.clone(),
            backlog: subscription.backlog,
        };
        if let Err(e) = write_message(&self.writer, &response).await {
            session.unsubscribe(subscription.id).await;
            return Err(RequestError::Unavailable(e.to_string()));
        }

        let forwarder = tokio::spawn(forward_events(
            subscription.receiver,
            Arc::clone(&self.writer),
            key.clone(),
        ));
        self.subscriptions.insert(
            key.clone(),
            ActiveSubscription {
                session,
                id: subscription.id,
                forwarder,
            },
        );

        Ok(())
    }

    async fn drop_subscriptions(&mut self) {
        for (_, active) in self.subscriptions.drain() {
            active.session.unsubscribe(active.id).await;
        }
    }

    fn projects_root(&self) -> Result<PathBuf, RequestError> {
        self.projects_root
            .clone()
            .ok_or_else(|| {
                RequestError::Unavailable("no home directory for the agent store".into())
            })
    }

    /// Reads a single message from the client.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = msg.message.name(),
            "Received message"
        );

        Ok(msg)
    }

    /// Sends a message to the client.
    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        write_message(&self.writer, &msg).await
    }

    /// Returns the client ID (if connected).
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

fn project_ref(path: String) -> Result<ProjectRef, RequestError> {
    ProjectRef::new(path)
        .map_err(|e| RequestError::Registry(RegistryError::Launch(LaunchError::from(e))))
}

/// Runs blocking store I/O off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, RequestError>
where
    F: FnOnce() -> Result<T, HistoryError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RequestError::Unavailable(format!("history task failed: {e}")))?
        .map_err(RequestError::from)
}

/// Writes events of one subscription until either side goes away.
async fn forward_events(
    mut receiver: mpsc::UnboundedReceiver<StreamEvent>,
    writer: ConnectionWriter,
    key: SessionKey,
) {
    while let Some(event) = receiver.recv().await {
        if let Err(e) = write_message(&writer, &DaemonMessage::event(event)).await {
            debug!(key = %key, error = %e, "Failed to forward event, dropping subscription");
            return;
        }
    }
    debug!(key = %key, "Subscription closed by session");
}

/// Writes one JSON line with the write timeout.
pub(crate) async fn write_message(
    writer: &ConnectionWriter,
    msg: &DaemonMessage,
) -> Result<(), ConnectionError> {
    let json =
        serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    let mut writer = writer.lock().await;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}
