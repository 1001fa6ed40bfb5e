//! Integration tests for the Unix socket server.
//!
//! These run a `DaemonServer` over a registry wired to scripted agents and
//! talk to it the way `crew` does: JSON lines over the socket.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.
//! We test the panic-free behavior of production code through assertions.

mod support;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crew_core::{
    EventKind, LaunchOptions, LaunchToken, Outcome, SessionId, SessionKey, SessionStatus,
};
use crew_protocol::{ClientMessage, DaemonMessage, ErrorCode, MessageType, ProtocolVersion};
use crewd::server::DaemonServer;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use support::{Harness, STEP};

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between socket existence checks
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period for server shutdown
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

// ============================================================================
// Test Helpers
// ============================================================================

/// Server over a fake-agent registry, with its own socket and history dirs.
struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    harness: Harness,
    history_root: TempDir,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let history_root = tempfile::tempdir().expect("create history dir");
        let socket_path = temp_dir.path().join("crew.sock");

        let harness = Harness::new();
        let cancel_token = CancellationToken::new();
        let server = DaemonServer::new(
            socket_path.clone(),
            harness.registry.clone(),
            cancel_token.clone(),
        )
        .with_projects_root(history_root.path());

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if socket_path.exists() {
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        Self {
            socket_path,
            cancel_token,
            harness,
            history_root,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    /// Connects and completes the handshake.
    async fn client(&self) -> TestClient {
        let mut client = self.connect().await;
        client.handshake(None).await;
        client
    }

    fn project_path(&self) -> String {
        self.harness.project_dir.path().display().to_string()
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

/// Test client connection with protocol helpers.
struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.send_raw(&json).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> DaemonMessage {
        let mut line = String::new();
        let read = timeout(STEP, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for the daemon")
            .unwrap();
        assert!(read > 0, "daemon closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    /// Sends a request and returns the first non-event reply.
    async fn request(&mut self, msg: ClientMessage) -> DaemonMessage {
        self.send(msg).await;
        loop {
            let reply = self.recv().await;
            if !reply.is_event() {
                return reply;
            }
        }
    }

    /// True once the daemon has closed the connection.
    async fn closed(&mut self) -> bool {
        let mut line = String::new();
        matches!(
            timeout(STEP, self.reader.read_line(&mut line)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    async fn handshake(&mut self, client_id: Option<String>) -> String {
        self.send(ClientMessage::connect(client_id)).await;
        match self.recv().await {
            DaemonMessage::Connected { client_id, .. } => client_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    async fn start(&mut self, project_path: &str, prompt: &str) -> LaunchToken {
        match self
            .request(ClientMessage::start_session(project_path, prompt, LaunchOptions::default()))
            .await
        {
            DaemonMessage::Launched { launch_token, session_id } => {
                assert_eq!(session_id, None);
                launch_token
            }
            other => panic!("Expected Launched, got {other:?}"),
        }
    }

    /// Next pushed event.
    async fn next_event(&mut self) -> crew_core::StreamEvent {
        match self.recv().await {
            DaemonMessage::Event { event } => *event,
            other => panic!("Expected Event, got {other:?}"),
        }
    }
}

fn error_code(msg: &DaemonMessage) -> Option<ErrorCode> {
    match msg {
        DaemonMessage::Error { code, .. } => *code,
        _ => None,
    }
}

fn write_transcript(root: &Path, project_id: &str, session_id: &str, lines: &[serde_json::Value]) {
    let dir = root.join(project_id);
    std::fs::create_dir_all(&dir).unwrap();
    let body: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    std::fs::write(dir.join(format!("{session_id}.jsonl")), body.join("\n")).unwrap();
}

// ============================================================================
// Connection Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_success() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage::connect(Some("test-client".to_string())))
        .await;
    match client.recv().await {
        DaemonMessage::Connected {
            protocol_version,
            client_id,
        } => {
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
            assert_eq!(client_id, "test-client");
        }
        other => panic!("Expected Connected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_assigns_client_id() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let client_id = client.handshake(None).await;
    assert!(client_id.starts_with("client-"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_version_mismatch_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage {
            protocol_version: ProtocolVersion::new(99, 0),
            message: MessageType::Connect { client_id: None },
        })
        .await;
    match client.recv().await {
        DaemonMessage::Rejected { protocol_version, .. } => {
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
        }
        other => panic!("Expected Rejected, got {other:?}"),
    }
    assert!(client.closed().await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_request_before_handshake_is_refused() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send(ClientMessage::ping(1)).await;
    let reply = client.recv().await;
    assert_eq!(error_code(&reply), Some(ErrorCode::NotConnected));
    assert!(client.closed().await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_pong_and_bad_lines() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    assert!(matches!(
        client.request(ClientMessage::ping(7)).await,
        DaemonMessage::Pong { seq: 7 }
    ));

    // A malformed line is answered, not fatal.
    client.send_raw("{not json").await;
    let reply = client.recv().await;
    assert_eq!(error_code(&reply), Some(ErrorCode::InvalidRequest));

    assert!(matches!(
        client.request(ClientMessage::ping(8)).await,
        DaemonMessage::Pong { seq: 8 }
    ));

    server.shutdown().await;
}

// ============================================================================
// Session Tests
// ============================================================================

#[tokio::test]
async fn test_start_subscribe_and_stream() {
    let mut server = TestServer::spawn().await;
    let mut client = server.client().await;

    let project = server.project_path();
    let token = client.start(&project, "explain this repo").await;
    let mut agent = server.harness.next_agent().await;
    assert_eq!(agent.prompt(), Some("explain this repo"));

    client
        .send(ClientMessage::subscribe(SessionKey::Token(token.clone())))
        .await;
    match client.recv().await {
        DaemonMessage::Subscribed { key, backlog } => {
            assert_eq!(key, SessionKey::Token(token.clone()));
            assert_eq!(backlog.len(), 1);
            assert!(matches!(backlog[0].kind, EventKind::PromptStarted { .. }));
        }
        other => panic!("Expected Subscribed, got {other:?}"),
    }

    agent.init("sess-wire").await;
    agent.emit(json!({"type": "assistant", "n": 1})).await;
    agent.result().await;
    agent.exit(0);

    let mut seqs = Vec::new();
    loop {
        let event = client.next_event().await;
        assert_eq!(event.launch_token, token);
        seqs.push(event.seq);
        if let EventKind::Completed { outcome, .. } = event.kind {
            assert_eq!(outcome, Outcome::Success);
            break;
        }
    }
    assert_eq!(seqs, vec![2, 3, 4, 5]);

    match client
        .request(ClientMessage::get_output(SessionId::new("sess-wire"), Some(3)))
        .await
    {
        DaemonMessage::Output { session_id, events } => {
            assert_eq!(session_id, SessionId::new("sess-wire"));
            assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
        }
        other => panic!("Expected Output, got {other:?}"),
    }

    match client
        .request(ClientMessage::get_session(SessionKey::Id(SessionId::new("sess-wire"))))
        .await
    {
        DaemonMessage::Session { session } => {
            assert_eq!(session.status, SessionStatus::Completed);
            assert_eq!(session.launch_token, token);
        }
        other => panic!("Expected Session, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_list_sessions_running_and_all() {
    let mut server = TestServer::spawn().await;
    let mut client = server.client().await;
    let project = server.project_path();

    client.start(&project, "one").await;
    let first = server.harness.next_agent().await;
    client.start(&project, "two").await;
    let _second = server.harness.next_agent().await;

    first.exit(0);
    support::eventually(|| async {
        server.harness.registry.list_running().await.len() == 1
    })
    .await;

    match client.request(ClientMessage::list_sessions(false)).await {
        DaemonMessage::SessionList { sessions } => assert_eq!(sessions.len(), 1),
        other => panic!("Expected SessionList, got {other:?}"),
    }
    match client.request(ClientMessage::list_sessions(true)).await {
        DaemonMessage::SessionList { sessions } => {
            assert_eq!(sessions.len(), 2);
            assert!(sessions[0].created_at <= sessions[1].created_at);
        }
        other => panic!("Expected SessionList, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_errors_carry_codes() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    let reply = client
        .request(ClientMessage::cancel_session(SessionId::new("missing")))
        .await;
    assert_eq!(error_code(&reply), Some(ErrorCode::UnknownSession));

    let reply = client
        .request(ClientMessage::start_session("relative/path", "hi", LaunchOptions::default()))
        .await;
    assert_eq!(error_code(&reply), Some(ErrorCode::InvalidPath));

    let missing = server.harness.project_dir.path().join("gone");
    let reply = client
        .request(ClientMessage::start_session(
            missing.display().to_string(),
            "hi",
            LaunchOptions::default(),
        ))
        .await;
    assert_eq!(error_code(&reply), Some(ErrorCode::InvalidPath));

    let reply = client
        .request(ClientMessage::resume_session(SessionId::new("stored"), "hi", None, None))
        .await;
    assert_eq!(error_code(&reply), Some(ErrorCode::InvalidRequest));

    server.shutdown().await;
}

#[tokio::test]
async fn test_enqueue_and_cancel_over_socket() {
    let mut server = TestServer::spawn().await;
    let mut client = server.client().await;
    let project = server.project_path();

    client.start(&project, "first").await;
    let mut agent = server.harness.next_agent().await;
    agent.init("sess-q").await;
    support::eventually(|| async {
        server
            .harness
            .registry
            .get_session(&SessionKey::Id(SessionId::new("sess-q")))
            .await
            .is_ok()
    })
    .await;

    match client
        .request(ClientMessage::enqueue_prompt(SessionId::new("sess-q"), "second"))
        .await
    {
        DaemonMessage::Enqueued { outcome } => {
            assert_eq!(
                outcome,
                crew_core::EnqueueOutcome::Queued { order: 1, position: 1 }
            );
        }
        other => panic!("Expected Enqueued, got {other:?}"),
    }

    assert!(matches!(
        client.request(ClientMessage::cancel_session(SessionId::new("sess-q"))).await,
        DaemonMessage::Ack
    ));

    support::eventually(|| async {
        server
            .harness
            .registry
            .get_session(&SessionKey::Id(SessionId::new("sess-q")))
            .await
            .map(|s| s.status.is_terminal())
            .unwrap_or(false)
    })
    .await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_events() {
    let mut server = TestServer::spawn().await;
    let mut client = server.client().await;
    let project = server.project_path();

    let token = client.start(&project, "hello").await;
    let mut agent = server.harness.next_agent().await;

    client
        .send(ClientMessage::subscribe(SessionKey::Token(token.clone())))
        .await;
    assert!(matches!(client.recv().await, DaemonMessage::Subscribed { .. }));

    match client
        .request(ClientMessage::unsubscribe(SessionKey::Token(token.clone())))
        .await
    {
        DaemonMessage::Unsubscribed { key } => assert_eq!(key, SessionKey::Token(token)),
        other => panic!("Expected Unsubscribed, got {other:?}"),
    }

    agent.emit(json!({"n": 1})).await;
    sleep(Duration::from_millis(50)).await;

    // The next line is the pong, not an event.
    client.send(ClientMessage::ping(1)).await;
    assert!(matches!(client.recv().await, DaemonMessage::Pong { seq: 1 }));

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_releases_subscription() {
    let mut server = TestServer::spawn().await;
    let mut client = server.client().await;
    let project = server.project_path();

    let token = client.start(&project, "hello").await;
    let _agent = server.harness.next_agent().await;
    client
        .send(ClientMessage::subscribe(SessionKey::Token(token.clone())))
        .await;
    assert!(matches!(client.recv().await, DaemonMessage::Subscribed { .. }));

    client.send(ClientMessage::disconnect()).await;
    assert!(client.closed().await);

    let key = SessionKey::Token(token);
    support::eventually(|| async {
        server.harness.registry.get_session(&key).await.unwrap().subscribers == 0
    })
    .await;

    server.shutdown().await;
}

// ============================================================================
// History Tests
// ============================================================================

#[tokio::test]
async fn test_history_requests() {
    let server = TestServer::spawn().await;
    let root = server.history_root.path().to_path_buf();
    write_transcript(
        &root,
        "-home-user-app",
        "stored-1",
        &[
            json!({"cwd": "/home/user/app", "type": "summary"}),
            json!({
                "message": {"role": "user", "content": "add a readme"},
                "timestamp": "2026-01-02T03:04:05Z",
            }),
        ],
    );

    let mut client = server.client().await;

    match client.request(ClientMessage::list_projects()).await {
        DaemonMessage::Projects { projects } => {
            assert_eq!(projects.len(), 1);
            assert_eq!(projects[0].id, "-home-user-app");
            assert_eq!(projects[0].path, "/home/user/app");
            assert_eq!(projects[0].sessions, vec!["stored-1".to_string()]);
        }
        other => panic!("Expected Projects, got {other:?}"),
    }

    match client
        .request(ClientMessage::list_project_sessions("-home-user-app"))
        .await
    {
        DaemonMessage::ProjectSessions { sessions } => {
            assert_eq!(sessions.len(), 1);
            assert_eq!(sessions[0].first_message.as_deref(), Some("add a readme"));
        }
        other => panic!("Expected ProjectSessions, got {other:?}"),
    }

    match client
        .request(ClientMessage::read_transcript("-home-user-app", "stored-1"))
        .await
    {
        DaemonMessage::Transcript { records } => assert_eq!(records.len(), 2),
        other => panic!("Expected Transcript, got {other:?}"),
    }

    let reply = client
        .request(ClientMessage::read_transcript("-home-user-app", "../../etc/passwd"))
        .await;
    assert_eq!(error_code(&reply), Some(ErrorCode::InvalidRequest));

    let reply = client
        .request(ClientMessage::read_transcript("-home-user-app", "nope"))
        .await;
    assert_eq!(error_code(&reply), Some(ErrorCode::NotFound));

    server.shutdown().await;
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_graceful_shutdown_removes_socket() {
    let server = TestServer::spawn().await;
    let socket_path = server.socket_path.clone();
    let mut client = server.client().await;

    server.shutdown().await;

    assert!(!socket_path.exists());
    assert!(client.closed().await);
}
