//! Frames exchanged between the manager and a sandbox worker.
//!
//! Every frame is one line of JSON. Requests carry a `request_id` the worker
//! echoes back so several calls can be in flight on one pipe.
//!
//! ```text
//! manager ──▶ {"request_id":3,"type":"load_module","module":{...},"params":{}}
//! worker  ──▶ {"request_id":3,"type":"loaded","interface":{...},"timings":{...}}
//! ```

use serde::{Deserialize, Serialize};

use sbx_core::{ClientIdentity, LoadErrorCode, ModuleInfo, ModuleInterface, ModuleName};

use crate::version::ProtocolVersion;

/// Requests the manager sends to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// First request on a fresh worker; answered with `Ready`
    Initialize {
        protocol_version: ProtocolVersion,
        identity: ClientIdentity,
    },

    /// Load a module and return its interface
    LoadModule {
        module: ModuleInfo,
        #[serde(default)]
        params: serde_json::Value,
    },

    /// Release a loaded module
    UnloadModule { module: ModuleName },

    /// Forward a client request to a loaded module
    RequestInterface {
        module: ModuleName,
        #[serde(default)]
        params: serde_json::Value,
    },

    /// Merge client-owned data into the worker's copy
    SyncData {
        #[serde(default)]
        update: serde_json::Value,
    },

    /// Ask the worker to exit cleanly
    Shutdown,
}

impl WorkerRequest {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::LoadModule { .. } => "load_module",
            Self::UnloadModule { .. } => "unload_module",
            Self::RequestInterface { .. } => "request_interface",
            Self::SyncData { .. } => "sync_data",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Timestamps a worker reports for one request, in microseconds since the
/// Unix epoch. Either may be missing when the worker could not measure it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTimings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

/// Responses a worker sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ready {
        protocol_version: ProtocolVersion,
    },

    Loaded {
        interface: ModuleInterface,
        #[serde(default)]
        timings: WorkerTimings,
    },

    LoadFailed {
        code: LoadErrorCode,
        message: String,
        #[serde(default)]
        timings: WorkerTimings,
    },

    Unloaded {
        #[serde(default)]
        timings: WorkerTimings,
    },

    Interface {
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default)]
        timings: WorkerTimings,
    },

    /// A request the worker could not serve
    RequestFailed {
        message: String,
        #[serde(default)]
        timings: WorkerTimings,
    },

    /// The worker applied a data update
    DataSynced {
        #[serde(default)]
        timings: WorkerTimings,
    },

    ShuttingDown,
}

impl WorkerResponse {
    /// Worker-side timings, when the response carries them.
    pub fn timings(&self) -> Option<WorkerTimings> {
        match self {
            Self::Loaded { timings, .. }
            | Self::LoadFailed { timings, .. }
            | Self::Unloaded { timings }
            | Self::Interface { timings, .. }
            | Self::RequestFailed { timings, .. }
            | Self::DataSynced { timings } => Some(*timings),
            Self::Ready { .. } | Self::ShuttingDown => None,
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Loaded { .. } => "loaded",
            Self::LoadFailed { .. } => "load_failed",
            Self::Unloaded { .. } => "unloaded",
            Self::Interface { .. } => "interface",
            Self::RequestFailed { .. } => "request_failed",
            Self::DataSynced { .. } => "data_synced",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// A request with its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub request_id: u64,
    #[serde(flatten)]
    pub request: WorkerRequest,
}

/// A response with the correlation id of the request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub request_id: u64,
    #[serde(flatten)]
    pub response: WorkerResponse,
}
