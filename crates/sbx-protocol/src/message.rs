//! Control-socket message types.

use serde::{Deserialize, Serialize};

use sbx_core::{ClientIdentity, LoadedModule, ModuleName, SandboxError, SandboxView};

use crate::version::ProtocolVersion;

/// Requests a control client can send to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake/connection request
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Load a module into the client's sandbox
    LoadModule {
        identity: ClientIdentity,
        module: ModuleName,
        #[serde(default)]
        params: serde_json::Value,
    },

    /// Unload a loaded module
    UnloadModule {
        identity: ClientIdentity,
        module: ModuleName,
    },

    /// Call into a loaded module
    RequestInterface {
        identity: ClientIdentity,
        module: ModuleName,
        #[serde(default)]
        params: serde_json::Value,
    },

    /// Push client data to the sandbox worker. If no worker is bound the
    /// connection is sent `sandbox_started` once one is.
    SyncData {
        identity: ClientIdentity,
        #[serde(default)]
        update: serde_json::Value,
    },

    /// Snapshot of one client's sandbox
    SandboxStatus { identity: ClientIdentity },

    /// Modules currently loaded for a client
    ListLoaded { identity: ClientIdentity },

    /// Snapshot of every sandbox
    Dump,

    /// Stop a client's sandbox worker
    StopSandbox { identity: ClientIdentity },

    /// Clear a restart block left by a worker death
    ResetSandbox { identity: ClientIdentity },

    /// The client application exited; drop all of its state
    ClientExited { identity: ClientIdentity },

    /// Receive `worker_died` messages for this client's sandbox
    WatchDeath { identity: ClientIdentity },

    /// Stop receiving `worker_died` messages for this client's sandbox
    UnwatchDeath { identity: ClientIdentity },

    /// Ping to check connection
    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    /// When the client issued the call, in microseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<u64>,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            sent_at: None,
            message,
        }
    }

    /// Stamps the client-side send time.
    #[must_use]
    pub fn sent_at(mut self, micros: u64) -> Self {
        self.sent_at = Some(micros);
        self
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn load_module(identity: ClientIdentity, module: impl Into<ModuleName>) -> Self {
        Self::new(MessageType::LoadModule {
            identity,
            module: module.into(),
            params: serde_json::Value::Null,
        })
    }

    pub fn unload_module(identity: ClientIdentity, module: impl Into<ModuleName>) -> Self {
        Self::new(MessageType::UnloadModule {
            identity,
            module: module.into(),
        })
    }

    pub fn request_interface(
        identity: ClientIdentity,
        module: impl Into<ModuleName>,
        params: serde_json::Value,
    ) -> Self {
        Self::new(MessageType::RequestInterface {
            identity,
            module: module.into(),
            params,
        })
    }

    pub fn sync_data(identity: ClientIdentity, update: serde_json::Value) -> Self {
        Self::new(MessageType::SyncData { identity, update })
    }

    pub fn sandbox_status(identity: ClientIdentity) -> Self {
        Self::new(MessageType::SandboxStatus { identity })
    }

    pub fn list_loaded(identity: ClientIdentity) -> Self {
        Self::new(MessageType::ListLoaded { identity })
    }

    pub fn watch_death(identity: ClientIdentity) -> Self {
        Self::new(MessageType::WatchDeath { identity })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    ModuleLoaded {
        identity: ClientIdentity,
        module: LoadedModule,
    },

    /// A load request was refused or failed
    ModuleLoadFailed {
        identity: ClientIdentity,
        module: ModuleName,
        message: String,
        code: String,
    },

    ModuleUnloaded {
        identity: ClientIdentity,
        module: ModuleName,
    },

    InterfaceResponse {
        identity: ClientIdentity,
        module: ModuleName,
        payload: serde_json::Value,
    },

    InterfaceFailed {
        identity: ClientIdentity,
        module: ModuleName,
        message: String,
        code: String,
    },

    /// The worker applied a data update
    DataSynced { identity: ClientIdentity },

    /// A worker was bound for a client whose earlier sync found none
    SandboxStarted { identity: ClientIdentity },

    SandboxStatus { sandbox: Box<SandboxView> },

    LoadedModules {
        identity: ClientIdentity,
        modules: Vec<LoadedModule>,
    },

    Dump { sandboxes: Vec<SandboxView> },

    /// A command without a payload completed
    Ack { operation: String },

    /// The watched client's worker died
    WorkerDied { identity: ClientIdentity },

    /// Pong response to ping
    Pong { seq: u64 },

    /// Error response
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn load_failed(identity: ClientIdentity, module: ModuleName, err: &SandboxError) -> Self {
        Self::ModuleLoadFailed {
            identity,
            module,
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }

    pub fn interface_failed(
        identity: ClientIdentity,
        module: ModuleName,
        err: &SandboxError,
    ) -> Self {
        Self::InterfaceFailed {
            identity,
            module,
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }

    pub fn ack(operation: &str) -> Self {
        Self::Ack {
            operation: operation.to_string(),
        }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    /// Creates an error response carrying a [`SandboxError`] code.
    pub fn sandbox_error(err: &SandboxError) -> Self {
        Self::Error {
            message: err.to_string(),
            code: Some(err.code().to_string()),
        }
    }
}
