//! Client interface of the sandbox manager.
//!
//! The `ManagerHandle` is cheap to clone. It runs the checks that need no
//! per-client state (policy, catalog) itself and routes everything else to
//! the client's actor, spawning the actor on first use.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `SandboxError::ChannelClosed`
//! - Lock poisoning is recovered from rather than propagated

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use sbx_core::{
    CallKind, ClientIdentity, LoadState, LoadedModule, ModuleName, SandboxError, SandboxView,
    Stage,
};

use super::actor::{ActorSettings, SandboxActor, Services};
use super::commands::{IdentityCommand, PendingLoad};
use crate::catalog::ModuleCatalog;
use crate::death::DeathCallback;
use crate::latency::{CallOutcome, LatencyTracker};
use crate::policy::{PolicyChecker, PolicyDecision};
use crate::sync::SandboxStartListener;
use crate::transport::WorkerHandle;

type ActorMap = HashMap<ClientIdentity, mpsc::Sender<IdentityCommand>>;

pub(crate) struct Shared {
    pub services: Arc<Services>,
    pub policy: Arc<dyn PolicyChecker>,
    pub catalog: Arc<dyn ModuleCatalog>,
    pub settings: ActorSettings,
    pub actors: Mutex<ActorMap>,
    pub shutdown: CancellationToken,
}

/// Handle for interacting with the sandbox manager.
///
/// # Usage
///
/// ```ignore
/// let pending = manager.request_load(&identity, &"ads".into(), params, None).await?;
/// let loaded = pending.wait().await?;
///
/// manager.request_unload(&identity, &"ads".into(), None).await?;
/// ```
#[derive(Clone)]
pub struct ManagerHandle {
    shared: Arc<Shared>,
}

impl ManagerHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    // ========================================================================
    // Binding
    // ========================================================================

    /// Returns the client's bound worker, binding one if none exists.
    ///
    /// Concurrent callers share a single bind.
    ///
    /// # Errors
    ///
    /// - `SandboxError::PolicyDenied` if the client may not have a sandbox
    /// - `SandboxError::WorkerUnavailable` if the bind failed or rebinding is blocked
    /// - `SandboxError::ChannelClosed` if the manager has shut down
    pub async fn connect(&self, identity: &ClientIdentity) -> Result<WorkerHandle, SandboxError> {
        if let PolicyDecision::Deny(reason) = self.shared.policy.check_connect(identity) {
            return Err(SandboxError::PolicyDenied { reason });
        }

        let (tx, rx) = oneshot::channel();
        self.dispatch(identity, IdentityCommand::Connect { respond_to: tx })
            .await?;
        rx.await.map_err(|_| SandboxError::ChannelClosed)?
    }

    // ========================================================================
    // Module Lifecycle
    // ========================================================================

    /// Starts loading `module` for `identity`.
    ///
    /// Returns once the load is accepted; the outcome arrives through the
    /// returned [`PendingLoad`]. `sent_at` is the client's own timestamp of
    /// the call, in microseconds since the Unix epoch, when it has one.
    ///
    /// # Errors
    ///
    /// - `SandboxError::PolicyDenied` if policy refuses the load
    /// - `SandboxError::ModuleNotFound` if the module is not installed
    /// - `SandboxError::AlreadyLoaded` if the module is loading or loaded
    /// - `SandboxError::WorkerUnavailable` if rebinding is blocked
    /// - `SandboxError::ChannelClosed` if the manager has shut down
    pub async fn request_load(
        &self,
        identity: &ClientIdentity,
        module: &ModuleName,
        params: Value,
        sent_at: Option<u64>,
    ) -> Result<PendingLoad, SandboxError> {
        let tracker = self.track(CallKind::LoadModule, sent_at);

        if let PolicyDecision::Deny(reason) = self.shared.policy.check_load(identity, module) {
            let err = SandboxError::PolicyDenied { reason };
            self.reject(identity, tracker, &err);
            return Err(err);
        }

        let Some(info) = self.shared.catalog.resolve(identity, module) else {
            let err = SandboxError::ModuleNotFound {
                module: module.clone(),
            };
            self.reject(identity, tracker, &err);
            return Err(err);
        };

        let (reply, receiver) = oneshot::channel();
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            identity,
            IdentityCommand::Load {
                module: info,
                params,
                tracker,
                reply,
                respond_to: tx,
            },
        )
        .await?;
        rx.await.map_err(|_| SandboxError::ChannelClosed)??;

        Ok(PendingLoad::new(module.clone(), receiver))
    }

    /// Loads `module` and waits for the outcome.
    ///
    /// # Errors
    ///
    /// Everything [`Self::request_load`] and [`PendingLoad::wait`] return.
    pub async fn load_module(
        &self,
        identity: &ClientIdentity,
        module: &ModuleName,
        params: Value,
        sent_at: Option<u64>,
    ) -> Result<LoadedModule, SandboxError> {
        self.request_load(identity, module, params, sent_at)
            .await?
            .wait()
            .await
    }

    /// Unloads `module`.
    ///
    /// Returns as soon as the session is unloaded; the worker is told in
    /// the background. Unloading a session that already ended is a no-op.
    ///
    /// # Errors
    ///
    /// - `SandboxError::InvalidState` if there is no session or it is still loading
    /// - `SandboxError::ChannelClosed` if the manager has shut down
    pub async fn request_unload(
        &self,
        identity: &ClientIdentity,
        module: &ModuleName,
        sent_at: Option<u64>,
    ) -> Result<(), SandboxError> {
        let tracker = self.track(CallKind::UnloadModule, sent_at);

        let Some(sender) = self.existing(identity) else {
            let err = SandboxError::invalid_state(format!("no session for module {module}"));
            self.reject(identity, tracker, &err);
            return Err(err);
        };

        let (tx, rx) = oneshot::channel();
        sender
            .send(IdentityCommand::Unload {
                module: module.clone(),
                tracker,
                respond_to: tx,
            })
            .await
            .map_err(|_| SandboxError::ChannelClosed)?;
        rx.await.map_err(|_| SandboxError::ChannelClosed)?
    }

    /// Sends `params` to a loaded module and returns its answer.
    ///
    /// # Errors
    ///
    /// - `SandboxError::NotLoaded` if the module is not loaded
    /// - `SandboxError::RequestFailed` if the module rejected the request
    /// - `SandboxError::WorkerUnavailable` if the worker died or timed out
    /// - `SandboxError::ChannelClosed` if the manager has shut down
    pub async fn request_interface(
        &self,
        identity: &ClientIdentity,
        module: &ModuleName,
        params: Value,
        sent_at: Option<u64>,
    ) -> Result<Value, SandboxError> {
        let tracker = self.track(CallKind::RequestInterface, sent_at);

        let Some(sender) = self.existing(identity) else {
            let err = SandboxError::NotLoaded {
                module: module.clone(),
            };
            self.reject(identity, tracker, &err);
            return Err(err);
        };

        let (tx, rx) = oneshot::channel();
        sender
            .send(IdentityCommand::RequestInterface {
                module: module.clone(),
                params,
                tracker,
                reply: tx,
            })
            .await
            .map_err(|_| SandboxError::ChannelClosed)?;
        rx.await.map_err(|_| SandboxError::ChannelClosed)?
    }

    // ========================================================================
    // Data Sync
    // ========================================================================

    /// Pushes a client data update to the client's worker.
    ///
    /// When no worker is bound the update is dropped and `listener`, if
    /// given, is told once the next time one is, so the client can resend.
    ///
    /// # Errors
    ///
    /// - `SandboxError::WorkerUnavailable` if no worker is bound or it died
    /// - `SandboxError::InvalidState` if the worker rejected the update
    /// - `SandboxError::ChannelClosed` if the manager has shut down
    pub async fn sync_data(
        &self,
        identity: &ClientIdentity,
        update: Value,
        listener: Option<Arc<dyn SandboxStartListener>>,
        sent_at: Option<u64>,
    ) -> Result<(), SandboxError> {
        let tracker = self.track(CallKind::SyncData, sent_at);

        if let PolicyDecision::Deny(reason) = self.shared.policy.check_connect(identity) {
            let err = SandboxError::PolicyDenied { reason };
            self.reject(identity, tracker, &err);
            return Err(err);
        }

        let (tx, rx) = oneshot::channel();
        self.dispatch(
            identity,
            IdentityCommand::SyncData {
                update,
                listener,
                tracker,
                respond_to: tx,
            },
        )
        .await?;
        rx.await.map_err(|_| SandboxError::ChannelClosed)?
    }

    // ========================================================================
    // Death Handling
    // ========================================================================

    /// Registers a callback fired on every worker death of `identity`.
    ///
    /// Returns false if the callback was already registered.
    pub fn add_death_callback(
        &self,
        identity: &ClientIdentity,
        callback: Arc<dyn DeathCallback>,
        sent_at: Option<u64>,
    ) -> bool {
        let tracker = self.track(CallKind::AddDeathCallback, sent_at);
        let added = self.shared.services.notifier.register(identity, callback);
        self.shared
            .services
            .finish_call(identity, tracker, CallOutcome::Success);
        added
    }

    /// Removes a death callback. Returns false if it was not registered.
    pub fn remove_death_callback(
        &self,
        identity: &ClientIdentity,
        callback: &Arc<dyn DeathCallback>,
        sent_at: Option<u64>,
    ) -> bool {
        let tracker = self.track(CallKind::RemoveDeathCallback, sent_at);
        let removed = self
            .shared
            .services
            .notifier
            .unregister(identity, callback);
        self.shared
            .services
            .finish_call(identity, tracker, CallOutcome::Success);
        removed
    }

    /// Reports that the transport lost `identity`'s worker.
    ///
    /// Ignored when the client has no sandbox.
    pub async fn on_worker_died(&self, identity: &ClientIdentity) {
        if let Some(sender) = self.existing(identity) {
            let _ = sender
                .send(IdentityCommand::WorkerDied { worker: None })
                .await;
        }
    }

    /// Stops the client's sandbox without firing death callbacks.
    ///
    /// Returns true if a worker, a bind, or a module was torn down.
    pub async fn stop_sandbox(&self, identity: &ClientIdentity) -> Result<bool, SandboxError> {
        let Some(sender) = self.existing(identity) else {
            return Ok(false);
        };
        let (tx, rx) = oneshot::channel();
        sender
            .send(IdentityCommand::Stop { respond_to: tx })
            .await
            .map_err(|_| SandboxError::ChannelClosed)?;
        rx.await.map_err(|_| SandboxError::ChannelClosed)
    }

    /// Clears a restart block. Returns true if one was set.
    pub async fn reset_sandbox(&self, identity: &ClientIdentity) -> Result<bool, SandboxError> {
        let Some(sender) = self.existing(identity) else {
            return Ok(false);
        };
        let (tx, rx) = oneshot::channel();
        sender
            .send(IdentityCommand::Reset { respond_to: tx })
            .await
            .map_err(|_| SandboxError::ChannelClosed)?;
        rx.await.map_err(|_| SandboxError::ChannelClosed)
    }

    /// Forgets a client whose own process is gone.
    ///
    /// Stops its sandbox, drops its death callbacks and any sandbox start
    /// listener, and retires its actor.
    pub async fn on_client_died(&self, identity: &ClientIdentity) {
        if let Some(sender) = self.existing(identity) {
            let (tx, rx) = oneshot::channel();
            if sender
                .send(IdentityCommand::Exit { respond_to: tx })
                .await
                .is_ok()
            {
                let _ = rx.await;
            }
            self.forget(identity, &sender);
        }

        let dropped = self.shared.services.notifier.remove_all(identity);
        info!(identity = %identity, callbacks = dropped, "Client exited");
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Returns a snapshot of the client's sandbox.
    pub async fn sandbox_status(
        &self,
        identity: &ClientIdentity,
    ) -> Result<SandboxView, SandboxError> {
        let Some(sender) = self.existing(identity) else {
            return Ok(self.empty_view(identity));
        };
        let (tx, rx) = oneshot::channel();
        sender
            .send(IdentityCommand::Snapshot { respond_to: tx })
            .await
            .map_err(|_| SandboxError::ChannelClosed)?;
        rx.await.map_err(|_| SandboxError::ChannelClosed)
    }

    /// Returns the state of the latest session of `module`, if any.
    pub async fn session_state(
        &self,
        identity: &ClientIdentity,
        module: &ModuleName,
    ) -> Result<Option<LoadState>, SandboxError> {
        let Some(sender) = self.existing(identity) else {
            return Ok(None);
        };
        let (tx, rx) = oneshot::channel();
        sender
            .send(IdentityCommand::SessionState {
                module: module.clone(),
                respond_to: tx,
            })
            .await
            .map_err(|_| SandboxError::ChannelClosed)?;
        rx.await.map_err(|_| SandboxError::ChannelClosed)
    }

    /// Returns the modules currently loaded for the client.
    pub async fn loaded_modules(
        &self,
        identity: &ClientIdentity,
    ) -> Result<Vec<LoadedModule>, SandboxError> {
        let Some(sender) = self.existing(identity) else {
            return Ok(Vec::new());
        };
        let (tx, rx) = oneshot::channel();
        sender
            .send(IdentityCommand::LoadedModules { respond_to: tx })
            .await
            .map_err(|_| SandboxError::ChannelClosed)?;
        rx.await.map_err(|_| SandboxError::ChannelClosed)
    }

    /// Returns a snapshot of every client the manager knows, ordered by identity.
    pub async fn dump(&self) -> Vec<SandboxView> {
        let actors: Vec<_> = self
            .lock()
            .iter()
            .map(|(identity, sender)| (identity.clone(), sender.clone()))
            .collect();

        let mut views = Vec::with_capacity(actors.len());
        for (identity, sender) in actors {
            let (tx, rx) = oneshot::channel();
            if sender
                .send(IdentityCommand::Snapshot { respond_to: tx })
                .await
                .is_err()
            {
                continue;
            }
            match rx.await {
                Ok(view) => views.push(view),
                Err(_) => debug!(identity = %identity, "Actor exited during dump"),
            }
        }
        views.sort_by(|a, b| a.identity.cmp(&b.identity));
        views
    }

    /// Stops every sandbox and retires every actor.
    ///
    /// Calls made afterwards fail with `SandboxError::ChannelClosed`.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let actors: Vec<_> = self.lock().drain().collect();
        info!(sandboxes = actors.len(), "Sandbox manager shutting down");

        for (_, sender) in actors {
            let (tx, rx) = oneshot::channel();
            if sender
                .send(IdentityCommand::Exit { respond_to: tx })
                .await
                .is_ok()
            {
                let _ = rx.await;
            }
        }
    }

    // ========================================================================
    // Actor Routing
    // ========================================================================

    /// Sends `cmd` to the client's actor, spawning one if needed.
    async fn dispatch(
        &self,
        identity: &ClientIdentity,
        cmd: IdentityCommand,
    ) -> Result<(), SandboxError> {
        let sender = self.actor_for(identity)?;
        match sender.send(cmd).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(cmd)) => {
                // The actor retired after the client exited; start over.
                self.forget(identity, &sender);
                self.actor_for(identity)?
                    .send(cmd)
                    .await
                    .map_err(|_| SandboxError::ChannelClosed)
            }
        }
    }

    fn actor_for(
        &self,
        identity: &ClientIdentity,
    ) -> Result<mpsc::Sender<IdentityCommand>, SandboxError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(SandboxError::ChannelClosed);
        }

        let mut actors = self.lock();
        if let Some(sender) = actors.get(identity) {
            return Ok(sender.clone());
        }

        let (tx, rx) = mpsc::channel(self.shared.settings.command_buffer);
        let actor = SandboxActor::new(
            identity.clone(),
            rx,
            tx.clone(),
            Arc::clone(&self.shared.services),
            self.shared.settings,
        );
        tokio::spawn(actor.run());
        actors.insert(identity.clone(), tx.clone());
        debug!(identity = %identity, "Sandbox actor spawned");
        Ok(tx)
    }

    fn existing(&self, identity: &ClientIdentity) -> Option<mpsc::Sender<IdentityCommand>> {
        self.lock().get(identity).cloned()
    }

    /// Drops the routing entry if it still points at `sender`.
    fn forget(&self, identity: &ClientIdentity, sender: &mpsc::Sender<IdentityCommand>) {
        let mut actors = self.lock();
        if actors
            .get(identity)
            .is_some_and(|current| current.same_channel(sender))
        {
            actors.remove(identity);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ActorMap> {
        self.shared
            .actors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn track(&self, kind: CallKind, sent_at: Option<u64>) -> LatencyTracker {
        LatencyTracker::start(kind, self.shared.services.now(), sent_at)
    }

    fn reject(&self, identity: &ClientIdentity, tracker: LatencyTracker, err: &SandboxError) {
        debug!(identity = %identity, call = %tracker.kind(), error = %err, "Call rejected");
        self.shared.services.finish_call(
            identity,
            tracker,
            CallOutcome::FailedAt(Stage::FrontendToApp),
        );
    }

    fn empty_view(&self, identity: &ClientIdentity) -> SandboxView {
        SandboxView {
            identity: identity.clone(),
            status: Default::default(),
            restart_blocked: false,
            death_generation: 0,
            pending_waiters: 0,
            death_callbacks: self.shared.services.notifier.count(identity),
            sessions: Vec::new(),
        }
    }
}
