//! Connection handler for individual control clients.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages
//! - Routes commands to the sandbox manager
//! - Forwards worker deaths for the sandboxes the client watches, and
//!   sandbox starts it is waiting for
//!
//! Loads and interface requests finish asynchronously. Their results are
//! written from spawned tasks through the shared writer, so one slow worker
//! does not hold up the rest of the connection.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use sbx_core::{ClientIdentity, ModuleName};
use sbx_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};

use crate::death::{CallbackError, DeathCallback};
use crate::manager::ManagerHandle;
use crate::sync::SandboxStartListener;

/// Shared handle to a client's write half
pub type ClientWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections that watch nothing (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Death callback that forwards the dying identity to a connection.
struct DeathWatch {
    sender: mpsc::UnboundedSender<DaemonMessage>,
}

impl DeathCallback for DeathWatch {
    fn on_worker_death(&self, identity: &ClientIdentity) -> Result<(), CallbackError> {
        self.sender
            .send(DaemonMessage::WorkerDied {
                identity: identity.clone(),
            })
            .map_err(|_| CallbackError("watching connection is gone".to_string()))
    }
}

/// Tells a connection that a sandbox it failed to sync with has started.
struct StartWatch {
    sender: mpsc::UnboundedSender<DaemonMessage>,
}

impl SandboxStartListener for StartWatch {
    fn on_sandbox_start(&self, identity: &ClientIdentity) {
        // A closed connection no longer cares.
        let _ = self.sender.send(DaemonMessage::SandboxStarted {
            identity: identity.clone(),
        });
    }
}

/// Connection handler for a single control client.
pub struct ConnectionHandler {
    /// Buffered reader for incoming messages
    reader: BufReader<OwnedReadHalf>,

    /// Buffered writer, shared with result and death forwarding tasks
    writer: ClientWriter,

    manager: ManagerHandle,

    /// Client identifier (assigned after handshake)
    client_id: Option<String>,

    connection_number: u64,

    /// Death watches this connection registered
    watches: HashMap<ClientIdentity, Arc<dyn DeathCallback>>,

    /// Unsolicited messages from death watches and start listeners
    events_tx: mpsc::UnboundedSender<DaemonMessage>,
    events_rx: Option<mpsc::UnboundedReceiver<DaemonMessage>>,
}

impl ConnectionHandler {
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `reader` - Read half of the Unix stream
    /// * `writer` - Write half of the Unix stream
    /// * `manager` - Handle to the sandbox manager
    /// * `connection_number` - Unique number for this connection
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        manager: ManagerHandle,
        connection_number: u64,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            manager,
            client_id: None,
            connection_number,
            watches: HashMap::new(),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Runs the connection handler.
    ///
    /// Performs the handshake, then processes messages until the
    /// connection closes. Death watches are removed on the way out.
    pub async fn run(mut self) -> Option<String> {
        debug!(connection = self.connection_number, "New client connected");

        if let Err(e) = self.handle_handshake().await {
            warn!(
                connection = self.connection_number,
                error = %e,
                "Handshake failed"
            );
            return None;
        }
        info!(client_id = ?self.client_id, "Client handshake completed");

        self.spawn_event_forwarder();

        if let Err(e) = self.process_messages().await {
            debug!(
                client_id = ?self.client_id,
                error = %e,
                "Connection closed"
            );
        }

        self.drop_watches();
        info!(client_id = ?self.client_id, "Client disconnected");
        self.client_id
    }

    /// Expects a `Connect` message, validates the protocol version, and
    /// responds with `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = self.read_message().await?;

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id = client_id
                    .unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id))
                    .await?;
                Ok(())
            }
            other => {
                self.send_message(DaemonMessage::error(
                    "Expected Connect message for handshake",
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Reads and processes messages until the connection closes or an
    /// unrecoverable error occurs.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Watching connections are expected to sit idle.
            let read = if self.watches.is_empty() {
                match timeout(READ_TIMEOUT, self.read_message()).await {
                    Ok(read) => read,
                    Err(_) => {
                        debug!(client_id = ?self.client_id, "Connection timed out");
                        return Err(ConnectionError::Timeout);
                    }
                }
            } else {
                self.read_message().await
            };

            let msg = match read {
                Ok(msg) => msg,
                Err(ConnectionError::Eof) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Err(ConnectionError::ParseError(reason)) => {
                    self.send_message(DaemonMessage::error(&format!("Parse error: {reason}")))
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.handle_message(msg).await?;
        }
    }

    /// Handles a single client message.
    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        let sent_at = msg.sent_at;
        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(DaemonMessage::error("Already connected"))
                    .await?;
            }

            MessageType::LoadModule {
                identity,
                module,
                params,
            } => {
                self.handle_load(identity, module, params, sent_at).await?;
            }

            MessageType::UnloadModule { identity, module } => {
                let reply = match self.manager.request_unload(&identity, &module, sent_at).await {
                    Ok(()) => DaemonMessage::ModuleUnloaded { identity, module },
                    Err(e) => DaemonMessage::sandbox_error(&e),
                };
                self.send_message(reply).await?;
            }

            MessageType::RequestInterface {
                identity,
                module,
                params,
            } => {
                self.handle_request_interface(identity, module, params, sent_at);
            }

            MessageType::SyncData { identity, update } => {
                self.handle_sync_data(identity, update, sent_at);
            }

            MessageType::SandboxStatus { identity } => {
                let reply = match self.manager.sandbox_status(&identity).await {
                    Ok(view) => DaemonMessage::SandboxStatus {
                        sandbox: Box::new(view),
                    },
                    Err(e) => DaemonMessage::sandbox_error(&e),
                };
                self.send_message(reply).await?;
            }

            MessageType::ListLoaded { identity } => {
                let reply = match self.manager.loaded_modules(&identity).await {
                    Ok(modules) => DaemonMessage::LoadedModules { identity, modules },
                    Err(e) => DaemonMessage::sandbox_error(&e),
                };
                self.send_message(reply).await?;
            }

            MessageType::Dump => {
                let sandboxes = self.manager.dump().await;
                self.send_message(DaemonMessage::Dump { sandboxes }).await?;
            }

            MessageType::StopSandbox { identity } => {
                let reply = match self.manager.stop_sandbox(&identity).await {
                    Ok(_) => DaemonMessage::ack("stop_sandbox"),
                    Err(e) => DaemonMessage::sandbox_error(&e),
                };
                self.send_message(reply).await?;
            }

            MessageType::ResetSandbox { identity } => {
                let reply = match self.manager.reset_sandbox(&identity).await {
                    Ok(_) => DaemonMessage::ack("reset_sandbox"),
                    Err(e) => DaemonMessage::sandbox_error(&e),
                };
                self.send_message(reply).await?;
            }

            MessageType::ClientExited { identity } => {
                self.manager.on_client_died(&identity).await;
                self.watches.remove(&identity);
                self.send_message(DaemonMessage::ack("client_exited")).await?;
            }

            MessageType::WatchDeath { identity } => {
                if !self.watches.contains_key(&identity) {
                    let watch: Arc<dyn DeathCallback> = Arc::new(DeathWatch {
                        sender: self.events_tx.clone(),
                    });
                    self.manager
                        .add_death_callback(&identity, Arc::clone(&watch), sent_at);
                    self.watches.insert(identity.clone(), watch);
                    debug!(client_id = ?self.client_id, identity = %identity, "Watching sandbox deaths");
                }
                self.send_message(DaemonMessage::ack("watch_death")).await?;
            }

            MessageType::UnwatchDeath { identity } => {
                if let Some(watch) = self.watches.remove(&identity) {
                    self.manager
                        .remove_death_callback(&identity, &watch, sent_at);
                }
                self.send_message(DaemonMessage::ack("unwatch_death"))
                    .await?;
            }

            MessageType::Ping { seq } => {
                self.send_message(DaemonMessage::pong(seq)).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    /// Accepts or refuses the load inline, then waits for its outcome in
    /// the background.
    async fn handle_load(
        &self,
        identity: ClientIdentity,
        module: ModuleName,
        params: serde_json::Value,
        sent_at: Option<u64>,
    ) -> Result<(), ConnectionError> {
        let pending = match self
            .manager
            .request_load(&identity, &module, params, sent_at)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                return self
                    .send_message(DaemonMessage::load_failed(identity, module, &e))
                    .await;
            }
        };

        let writer = Arc::clone(&self.writer);
        tokio::spawn(async move {
            let reply = match pending.wait().await {
                Ok(loaded) => DaemonMessage::ModuleLoaded {
                    identity,
                    module: loaded,
                },
                Err(e) => DaemonMessage::load_failed(identity, module, &e),
            };
            if let Err(e) = write_message(&writer, &reply).await {
                debug!(error = %e, "Failed to deliver load result");
            }
        });
        Ok(())
    }

    fn handle_request_interface(
        &self,
        identity: ClientIdentity,
        module: ModuleName,
        params: serde_json::Value,
        sent_at: Option<u64>,
    ) {
        let manager = self.manager.clone();
        let writer = Arc::clone(&self.writer);
        tokio::spawn(async move {
            let reply = match manager
                .request_interface(&identity, &module, params, sent_at)
                .await
            {
                Ok(payload) => DaemonMessage::InterfaceResponse {
                    identity,
                    module,
                    payload,
                },
                Err(e) => DaemonMessage::interface_failed(identity, module, &e),
            };
            if let Err(e) = write_message(&writer, &reply).await {
                debug!(error = %e, "Failed to deliver interface response");
            }
        });
    }

    /// Syncs in the background. A failed sync leaves a listener behind
    /// that later reports `sandbox_started` on this connection.
    fn handle_sync_data(
        &self,
        identity: ClientIdentity,
        update: serde_json::Value,
        sent_at: Option<u64>,
    ) {
        let manager = self.manager.clone();
        let writer = Arc::clone(&self.writer);
        let listener: Arc<dyn SandboxStartListener> = Arc::new(StartWatch {
            sender: self.events_tx.clone(),
        });
        tokio::spawn(async move {
            let reply = match manager
                .sync_data(&identity, update, Some(listener), sent_at)
                .await
            {
                Ok(()) => DaemonMessage::DataSynced { identity },
                Err(e) => DaemonMessage::sandbox_error(&e),
            };
            if let Err(e) = write_message(&writer, &reply).await {
                debug!(error = %e, "Failed to deliver sync result");
            }
        });
    }

    /// Writes every message a death watch or start listener reports.
    fn spawn_event_forwarder(&mut self) {
        let Some(mut events_rx) = self.events_rx.take() else {
            return;
        };
        let writer = Arc::clone(&self.writer);
        let client_id = self.client_id.clone();

        tokio::spawn(async move {
            while let Some(msg) = events_rx.recv().await {
                if let Err(e) = write_message(&writer, &msg).await {
                    debug!(client_id = ?client_id, error = %e, "Failed to forward sandbox event");
                    break;
                }
            }
        });
    }

    fn drop_watches(&mut self) {
        for (identity, watch) in self.watches.drain() {
            self.manager.remove_death_callback(&identity, &watch, None);
        }
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
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        write_message(&self.writer, &msg).await
    }

    /// Returns the client ID (if connected).
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

/// Writes one JSON line to a client.
pub async fn write_message(writer: &ClientWriter, msg: &DaemonMessage) -> Result<(), ConnectionError> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_death_watch_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let watch = DeathWatch { sender: tx };
        let identity = ClientIdentity::new(1, "com.example");

        assert!(watch.on_worker_death(&identity).is_ok());
        drop(rx);
        assert!(watch.on_worker_death(&identity).is_err());
    }

    #[test]
    fn test_start_watch_forwards_identity() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watch = StartWatch { sender: tx };
        let identity = ClientIdentity::new(1, "com.example");

        watch.on_sandbox_start(&identity);
        match rx.try_recv() {
            Ok(DaemonMessage::SandboxStarted { identity: started }) => {
                assert_eq!(started, identity)
            }
            other => panic!("Expected SandboxStarted, got {other:?}"),
        }

        drop(rx);
        // Must not panic once the connection is gone.
        watch.on_sandbox_start(&identity);
    }
}
