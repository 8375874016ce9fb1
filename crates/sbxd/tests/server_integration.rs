//! Integration tests for the Unix socket server.
//!
//! These tests run the daemon server against a manager that spawns the
//! real `sbx-worker` binary, covering the handshake, module lifecycle over
//! the socket, death watches, and error replies.
//!
//! Tests may use `.unwrap()` and `.expect()`; the panic-free behavior of
//! production code is checked through assertions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sbx_core::{ClientIdentity, ModuleInfo, ModuleName};
use sbx_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};
use sbxd::config::ManagerConfig;
use sbxd::manager::{spawn_manager, ManagerHandle};
use sbxd::server::DaemonServer;
use sbxd::transport::ProcessTransport;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between socket existence checks
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum time to wait for any single reply
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle and cleanup.
struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    manager: ManagerHandle,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("sbxd.sock");

        let mut config = ManagerConfig::default();
        config.socket_path = socket_path.clone();
        config.worker.command = vec![env!("CARGO_BIN_EXE_sbx-worker").to_string()];
        config.modules = vec![
            ModuleInfo::new("ads", "com.example.ads"),
            ModuleInfo::new("maps", "com.example.maps").with_version("2.1"),
        ];

        let transport = Arc::new(ProcessTransport::new(config.worker.clone()));
        let manager = spawn_manager(config, transport);
        let cancel_token = CancellationToken::new();

        let server = DaemonServer::new(socket_path.clone(), manager.clone(), cancel_token.clone());
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
            manager,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    async fn shutdown(self) {
        self.manager.shutdown().await;
        self.cancel_token.cancel();
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

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.send_raw(&json).await;
    }

    async fn recv(&mut self) -> DaemonMessage {
        let mut line = String::new();
        timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("reply within timeout")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn handshake(&mut self) -> String {
        self.send(ClientMessage::connect(Some("test-client".to_string())))
            .await;
        match self.recv().await {
            DaemonMessage::Connected { client_id, .. } => client_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    async fn load(&mut self, identity: &ClientIdentity, module: &str) -> DaemonMessage {
        self.send(ClientMessage::load_module(identity.clone(), module))
            .await;
        self.recv().await
    }
}

fn app_identity() -> ClientIdentity {
    ClientIdentity::new(10_042, "com.example.app")
}

// ============================================================================
// Handshake Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_and_ping() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    assert_eq!(client.handshake().await, "test-client");

    client.send(ClientMessage::ping(7)).await;
    assert!(matches!(client.recv().await, DaemonMessage::Pong { seq: 7 }));

    server.shutdown().await;
}

#[tokio::test]
async fn test_incompatible_version_is_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let mut msg = ClientMessage::connect(None);
    msg.protocol_version = ProtocolVersion::new(99, 0);
    client.send(msg).await;

    match client.recv().await {
        DaemonMessage::Rejected { reason, .. } => assert!(reason.contains("99.0")),
        other => panic!("Expected Rejected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_parse_error_keeps_connection_open() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake().await;

    client.send_raw("{ not json").await;
    assert!(matches!(client.recv().await, DaemonMessage::Error { .. }));

    client.send(ClientMessage::ping(1)).await;
    assert!(matches!(client.recv().await, DaemonMessage::Pong { seq: 1 }));

    server.shutdown().await;
}

// ============================================================================
// Module Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_module_lifecycle_over_socket() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake().await;
    let id = app_identity();

    match client.load(&id, "maps").await {
        DaemonMessage::ModuleLoaded { identity, module } => {
            assert_eq!(identity, id);
            assert_eq!(module.name, ModuleName::new("maps"));
            assert_eq!(module.interface.token, "maps-1");
            assert_eq!(module.interface.metadata["version"], "2.1");
        }
        other => panic!("Expected ModuleLoaded, got {other:?}"),
    }

    client
        .send(ClientMessage::request_interface(
            id.clone(),
            "maps",
            json!({"zoom": 12}),
        ))
        .await;
    match client.recv().await {
        DaemonMessage::InterfaceResponse { payload, .. } => {
            assert_eq!(payload["echo"]["zoom"], 12);
            assert_eq!(payload["token"], "maps-1");
        }
        other => panic!("Expected InterfaceResponse, got {other:?}"),
    }

    client.send(ClientMessage::list_loaded(id.clone())).await;
    match client.recv().await {
        DaemonMessage::LoadedModules { modules, .. } => assert_eq!(modules.len(), 1),
        other => panic!("Expected LoadedModules, got {other:?}"),
    }

    client.send(ClientMessage::unload_module(id.clone(), "maps")).await;
    assert!(matches!(
        client.recv().await,
        DaemonMessage::ModuleUnloaded { .. }
    ));

    client.send(ClientMessage::sandbox_status(id.clone())).await;
    match client.recv().await {
        DaemonMessage::SandboxStatus { sandbox } => {
            assert_eq!(sandbox.loaded_count(), 0);
            assert_eq!(sandbox.sessions.len(), 1);
        }
        other => panic!("Expected SandboxStatus, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_load_errors_carry_codes() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake().await;
    let id = app_identity();

    match client.load(&id, "missing").await {
        DaemonMessage::ModuleLoadFailed { code, .. } => assert_eq!(code, "module_not_found"),
        other => panic!("Expected ModuleLoadFailed, got {other:?}"),
    }

    client
        .send(ClientMessage::request_interface(id.clone(), "ads", json!({})))
        .await;
    match client.recv().await {
        DaemonMessage::InterfaceFailed { code, .. } => assert_eq!(code, "not_loaded"),
        other => panic!("Expected InterfaceFailed, got {other:?}"),
    }

    client.send(ClientMessage::unload_module(id.clone(), "ads")).await;
    match client.recv().await {
        DaemonMessage::Error { code, .. } => assert_eq!(code.as_deref(), Some("invalid_state")),
        other => panic!("Expected Error, got {other:?}"),
    }

    server.shutdown().await;
}

// ============================================================================
// Data Sync Tests
// ============================================================================

#[tokio::test]
async fn test_sync_before_sandbox_reports_start() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake().await;
    let id = app_identity();

    client
        .send(ClientMessage::sync_data(id.clone(), json!({"consent": true})))
        .await;
    match client.recv().await {
        DaemonMessage::Error { code, .. } => {
            assert_eq!(code.as_deref(), Some("worker_unavailable"))
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    client
        .send(ClientMessage::load_module(id.clone(), "ads"))
        .await;
    let mut loaded = false;
    let mut started = false;
    for _ in 0..2 {
        match client.recv().await {
            DaemonMessage::ModuleLoaded { .. } => loaded = true,
            DaemonMessage::SandboxStarted { identity } => {
                assert_eq!(identity, id);
                started = true;
            }
            other => panic!("Unexpected message: {other:?}"),
        }
    }
    assert!(loaded && started);

    client
        .send(ClientMessage::sync_data(id.clone(), json!({"consent": true})))
        .await;
    assert!(matches!(
        client.recv().await,
        DaemonMessage::DataSynced { .. }
    ));

    client
        .send(ClientMessage::request_interface(id.clone(), "ads", json!({})))
        .await;
    match client.recv().await {
        DaemonMessage::InterfaceResponse { payload, .. } => {
            assert_eq!(payload["data"]["consent"], true);
        }
        other => panic!("Expected InterfaceResponse, got {other:?}"),
    }

    server.shutdown().await;
}

// ============================================================================
// Death Watch Tests
// ============================================================================

#[tokio::test]
async fn test_watcher_hears_worker_crash() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake().await;
    let id = app_identity();

    client.send(ClientMessage::watch_death(id.clone())).await;
    assert!(matches!(client.recv().await, DaemonMessage::Ack { .. }));

    assert!(matches!(
        client.load(&id, "ads").await,
        DaemonMessage::ModuleLoaded { .. }
    ));

    client
        .send(ClientMessage::new(MessageType::LoadModule {
            identity: id.clone(),
            module: ModuleName::new("maps"),
            params: json!({"crash": true}),
        }))
        .await;

    let mut load_failed = false;
    let mut died = false;
    for _ in 0..2 {
        match client.recv().await {
            DaemonMessage::ModuleLoadFailed { code, .. } => {
                assert_eq!(code, "worker_unavailable");
                load_failed = true;
            }
            DaemonMessage::WorkerDied { identity } => {
                assert_eq!(identity, id);
                died = true;
            }
            other => panic!("Unexpected message: {other:?}"),
        }
    }
    assert!(load_failed && died);

    // The next load binds a fresh worker.
    assert!(matches!(
        client.load(&id, "ads").await,
        DaemonMessage::ModuleLoaded { .. }
    ));

    client.send(ClientMessage::sandbox_status(id.clone())).await;
    match client.recv().await {
        DaemonMessage::SandboxStatus { sandbox } => {
            assert_eq!(sandbox.death_generation, 1);
            assert_eq!(sandbox.death_callbacks, 1);
        }
        other => panic!("Expected SandboxStatus, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_watch_is_dropped_with_connection() {
    let server = TestServer::spawn().await;
    let id = app_identity();

    {
        let mut watcher = server.connect().await;
        watcher.handshake().await;
        watcher.send(ClientMessage::watch_death(id.clone())).await;
        assert!(matches!(watcher.recv().await, DaemonMessage::Ack { .. }));
        watcher.send(ClientMessage::disconnect()).await;
    }

    let start = tokio::time::Instant::now();
    loop {
        let view = server.manager.sandbox_status(&id).await.unwrap();
        if view.death_callbacks == 0 {
            break;
        }
        assert!(start.elapsed() < RECV_TIMEOUT, "watch was never dropped");
        sleep(SOCKET_POLL_INTERVAL).await;
    }

    server.shutdown().await;
}
