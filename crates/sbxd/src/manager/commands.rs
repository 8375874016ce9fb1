//! Commands understood by a client's sandbox actor.
//!
//! External commands come from [`super::ManagerHandle`] and carry a oneshot
//! channel for the reply. Completion commands are posted back to the actor
//! by the tasks it spawns for transport calls, so every state change still
//! happens inside the actor.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use sbx_core::{
    LoadState, LoadedModule, ModuleInfo, ModuleName, SandboxError, SandboxView,
};
use sbx_protocol::WorkerResponse;

use crate::latency::LatencyTracker;
use crate::sandbox::{InterfaceReply, LoadReply};
use crate::sync::SandboxStartListener;
use crate::transport::{TransportError, WorkerHandle, WorkerId};

// ============================================================================
// Actor Commands
// ============================================================================

/// Commands sent to a [`super::actor::SandboxActor`].
#[derive(Debug)]
pub enum IdentityCommand {
    /// Get a bound worker, binding one if needed.
    Connect {
        respond_to: oneshot::Sender<Result<WorkerHandle, SandboxError>>,
    },

    /// Start loading a module.
    ///
    /// `respond_to` answers whether the load was accepted; `reply` later
    /// carries its outcome.
    Load {
        module: ModuleInfo,
        params: Value,
        tracker: LatencyTracker,
        reply: LoadReply,
        respond_to: oneshot::Sender<Result<(), SandboxError>>,
    },

    /// Unload a module.
    Unload {
        module: ModuleName,
        tracker: LatencyTracker,
        respond_to: oneshot::Sender<Result<(), SandboxError>>,
    },

    /// Forward a request to a loaded module.
    RequestInterface {
        module: ModuleName,
        params: Value,
        tracker: LatencyTracker,
        reply: InterfaceReply,
    },

    /// Push client data to the bound worker.
    ///
    /// With no worker bound the call fails and `listener`, if any, is kept
    /// until the next bind.
    SyncData {
        update: Value,
        listener: Option<Arc<dyn SandboxStartListener>>,
        tracker: LatencyTracker,
        respond_to: oneshot::Sender<Result<(), SandboxError>>,
    },

    /// The worker died. `worker` is set when the reporter knows which one.
    WorkerDied { worker: Option<WorkerId> },

    /// Tear the sandbox down without firing death callbacks.
    Stop { respond_to: oneshot::Sender<bool> },

    /// Clear a restart block left by a death under the forbid policy.
    Reset { respond_to: oneshot::Sender<bool> },

    Snapshot {
        respond_to: oneshot::Sender<SandboxView>,
    },

    LoadedModules {
        respond_to: oneshot::Sender<Vec<LoadedModule>>,
    },

    SessionState {
        module: ModuleName,
        respond_to: oneshot::Sender<Option<LoadState>>,
    },

    /// Stop and exit. Sent when the client is gone or the manager shuts down.
    Exit { respond_to: oneshot::Sender<()> },

    // ------------------------------------------------------------------------
    // Completions posted by the actor's own tasks
    // ------------------------------------------------------------------------
    BindCompleted {
        generation: u64,
        result: Result<WorkerHandle, TransportError>,
        completed_at: u64,
    },

    LoadCompleted {
        module: ModuleName,
        session: u64,
        result: Result<WorkerResponse, TransportError>,
        resumed_at: u64,
    },

    UnloadCompleted {
        module: ModuleName,
        worker: WorkerId,
        tracker: LatencyTracker,
        result: Result<WorkerResponse, TransportError>,
        resumed_at: u64,
    },

    SyncCompleted {
        tracker: LatencyTracker,
        respond_to: oneshot::Sender<Result<(), SandboxError>>,
        result: Result<WorkerResponse, TransportError>,
        resumed_at: u64,
    },

    InterfaceCompleted {
        module: ModuleName,
        session: u64,
        request: u64,
        result: Result<WorkerResponse, TransportError>,
        resumed_at: u64,
    },
}

// ============================================================================
// Pending Load
// ============================================================================

/// An accepted load whose outcome is still on its way.
#[derive(Debug)]
pub struct PendingLoad {
    module: ModuleName,
    receiver: oneshot::Receiver<Result<LoadedModule, SandboxError>>,
}

impl PendingLoad {
    pub(crate) fn new(
        module: ModuleName,
        receiver: oneshot::Receiver<Result<LoadedModule, SandboxError>>,
    ) -> Self {
        Self { module, receiver }
    }

    pub fn module(&self) -> &ModuleName {
        &self.module
    }

    /// Waits for the load to finish.
    ///
    /// # Errors
    ///
    /// - `SandboxError::WorkerUnavailable` if the bind failed or the worker died
    /// - `SandboxError::LoadFailed` if the worker could not load the module
    /// - `SandboxError::ChannelClosed` if the manager went away first
    pub async fn wait(self) -> Result<LoadedModule, SandboxError> {
        self.receiver
            .await
            .map_err(|_| SandboxError::ChannelClosed)?
    }
}
