//! Sandbox actor - owns one client's worker binding and module sessions.
//!
//! Every state change for a client happens inside its actor, one command at
//! a time. Transport calls never run inside the actor: they are spawned as
//! tasks that post a completion command back, so a slow worker never holds
//! up the client's other commands, let alone other clients.
//!
//! # Death ordering
//!
//! Before serving any external command the actor checks whether its bound
//! worker has closed and, if so, processes the death first. A caller can
//! therefore never be handed a worker that already died, and death
//! callbacks always run before the next bind for the same client.
//!
//! # Unload ordering
//!
//! Unloading answers the caller at once and tells the worker in the
//! background. A reload of the same module on the same worker is held back
//! until the worker has acknowledged the unload, so the worker always sees
//! the two requests in the order the client made them.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Reply send failures are ignored (the caller stopped waiting)
//! - Completions that arrive for replaced sessions or stale binds are dropped

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use sbx_core::{
    ClientIdentity, Hop, LoadState, LoadedModule, ModuleInfo, ModuleName, RestartPolicy,
    SandboxError, SandboxStatus, SandboxView, Stage,
};
use sbx_protocol::{WorkerRequest, WorkerResponse};

use super::commands::IdentityCommand;
use crate::death::{report_orphan, DeathNotifier, OrphanHandler};
use crate::latency::{CallOutcome, Clock, LatencyTracker};
use crate::sandbox::{BindWaiter, ConnectStep, LoadSession, SandboxConnection, Teardown};
use crate::sync::{notify_start, SandboxStartListener};
use crate::telemetry::TelemetrySink;
use crate::transport::{TransportError, WorkerHandle, WorkerId, WorkerTransport};

// ============================================================================
// Shared Services
// ============================================================================

/// Collaborators shared by every actor.
pub(crate) struct Services {
    pub transport: Arc<dyn WorkerTransport>,
    pub notifier: Arc<DeathNotifier>,
    pub orphans: Arc<dyn OrphanHandler>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    pub fn now(&self) -> u64 {
        self.clock.now_micros()
    }

    /// Ends a tracked call and hands its samples to telemetry.
    pub fn finish_call(
        &self,
        identity: &ClientIdentity,
        tracker: LatencyTracker,
        outcome: CallOutcome,
    ) {
        for sample in tracker.finish(self.now(), outcome) {
            self.telemetry.record_latency(identity, &sample);
        }
    }

    /// Ends a call that failed wherever it currently is.
    pub fn fail_call(&self, identity: &ClientIdentity, tracker: LatencyTracker) {
        let stage = tracker.in_flight_stage();
        self.finish_call(identity, tracker, CallOutcome::FailedAt(stage));
    }
}

/// Per-actor settings taken from the manager configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActorSettings {
    pub restart_policy: RestartPolicy,
    pub unbind_when_idle: bool,
    pub command_buffer: usize,
}

// ============================================================================
// Sandbox Actor
// ============================================================================

/// The actor owning one client's sandbox.
pub(crate) struct SandboxActor {
    identity: ClientIdentity,

    receiver: mpsc::Receiver<IdentityCommand>,

    /// Handed to spawned tasks so they can post completions
    sender: mpsc::Sender<IdentityCommand>,

    services: Arc<Services>,
    settings: ActorSettings,

    connection: SandboxConnection,

    /// Latest session per module. Terminal sessions stay until replaced.
    sessions: HashMap<ModuleName, LoadSession>,

    /// Modules whose unload the worker has not acknowledged yet
    unloading: HashMap<ModuleName, WorkerId>,

    /// Loads waiting for an unload of the same module to be acknowledged
    held_loads: HashMap<ModuleName, (u64, WorkerHandle)>,

    /// Told once on the next successful bind
    start_listener: Option<Arc<dyn SandboxStartListener>>,

    next_session: u64,
}

impl SandboxActor {
    pub fn new(
        identity: ClientIdentity,
        receiver: mpsc::Receiver<IdentityCommand>,
        sender: mpsc::Sender<IdentityCommand>,
        services: Arc<Services>,
        settings: ActorSettings,
    ) -> Self {
        Self {
            connection: SandboxConnection::new(identity.clone(), settings.restart_policy),
            identity,
            receiver,
            sender,
            services,
            settings,
            sessions: HashMap::new(),
            unloading: HashMap::new(),
            held_loads: HashMap::new(),
            start_listener: None,
            next_session: 0,
        }
    }

    /// Runs the actor until it is told to exit.
    pub async fn run(mut self) {
        debug!(identity = %self.identity, "Sandbox actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            if let IdentityCommand::Exit { respond_to } = cmd {
                self.stop("sandbox client exited");
                let _ = respond_to.send(());
                break;
            }
            self.handle_command(cmd);
        }

        self.drain().await;
        debug!(identity = %self.identity, "Sandbox actor stopped");
    }

    /// Releases workers whose binds finished after the actor stopped.
    async fn drain(&mut self) {
        self.receiver.close();
        while let Some(cmd) = self.receiver.recv().await {
            if let IdentityCommand::BindCompleted {
                result: Ok(worker), ..
            } = cmd
            {
                self.release_worker(worker);
            }
        }
    }

    fn handle_command(&mut self, cmd: IdentityCommand) {
        match cmd {
            IdentityCommand::Connect { respond_to } => {
                self.reap_if_closed();
                self.handle_connect(respond_to);
            }
            IdentityCommand::Load {
                module,
                params,
                tracker,
                reply,
                respond_to,
            } => {
                self.reap_if_closed();
                let result = self.handle_load(module, params, tracker, reply);
                let _ = respond_to.send(result);
            }
            IdentityCommand::Unload {
                module,
                tracker,
                respond_to,
            } => {
                self.reap_if_closed();
                let result = self.handle_unload(module, tracker);
                let _ = respond_to.send(result);
            }
            IdentityCommand::RequestInterface {
                module,
                params,
                tracker,
                reply,
            } => {
                self.reap_if_closed();
                self.handle_request_interface(module, params, tracker, reply);
            }
            IdentityCommand::SyncData {
                update,
                listener,
                tracker,
                respond_to,
            } => {
                self.reap_if_closed();
                self.handle_sync_data(update, listener, tracker, respond_to);
            }
            IdentityCommand::WorkerDied { worker } => {
                self.handle_worker_died(worker);
            }
            IdentityCommand::Stop { respond_to } => {
                let stopped = self.stop("sandbox stopped");
                let _ = respond_to.send(stopped);
            }
            IdentityCommand::Reset { respond_to } => {
                let cleared = self.connection.reset();
                if cleared {
                    info!(identity = %self.identity, "Restart block cleared");
                }
                let _ = respond_to.send(cleared);
            }
            IdentityCommand::Snapshot { respond_to } => {
                self.reap_if_closed();
                let _ = respond_to.send(self.snapshot());
            }
            IdentityCommand::LoadedModules { respond_to } => {
                let _ = respond_to.send(self.loaded_modules());
            }
            IdentityCommand::SessionState { module, respond_to } => {
                let state = self.sessions.get(&module).map(LoadSession::state);
                let _ = respond_to.send(state);
            }
            IdentityCommand::Exit { respond_to } => {
                // Handled by the run loop.
                let _ = respond_to.send(());
            }
            IdentityCommand::BindCompleted {
                generation,
                result,
                completed_at,
            } => {
                self.handle_bind_completed(generation, result, completed_at);
            }
            IdentityCommand::LoadCompleted {
                module,
                session,
                result,
                resumed_at,
            } => {
                self.handle_load_completed(module, session, result, resumed_at);
            }
            IdentityCommand::UnloadCompleted {
                module,
                worker,
                tracker,
                result,
                resumed_at,
            } => {
                self.handle_unload_completed(module, worker, tracker, result, resumed_at);
            }
            IdentityCommand::SyncCompleted {
                tracker,
                respond_to,
                result,
                resumed_at,
            } => {
                self.handle_sync_completed(tracker, respond_to, result, resumed_at);
            }
            IdentityCommand::InterfaceCompleted {
                module,
                session,
                request,
                result,
                resumed_at,
            } => {
                self.handle_interface_completed(module, session, request, result, resumed_at);
            }
        }
    }

    // ========================================================================
    // Binding
    // ========================================================================

    fn handle_connect(&mut self, respond_to: oneshot::Sender<Result<WorkerHandle, SandboxError>>) {
        let step = self.connection.connect(BindWaiter::Caller(respond_to));
        self.apply_connect_step(step);
    }

    fn apply_connect_step(&mut self, step: ConnectStep) {
        match step {
            ConnectStep::Ready(worker, waiter) => {
                let now = self.services.now();
                self.resolve_waiter(waiter, &worker, now);
            }
            ConnectStep::Queued => {}
            ConnectStep::Bind { generation } => self.spawn_bind(generation),
            ConnectStep::Refused(err, waiter) => self.fail_waiter(waiter, err),
        }
    }

    fn spawn_bind(&self, generation: u64) {
        info!(identity = %self.identity, generation, "Binding sandbox worker");

        let identity = self.identity.clone();
        let services = Arc::clone(&self.services);
        let sender = self.sender.clone();

        tokio::spawn(async move {
            let result = services.transport.bind(&identity).await;
            let completed_at = services.now();
            let cmd = IdentityCommand::BindCompleted {
                generation,
                result,
                completed_at,
            };
            if let Err(mpsc::error::SendError(IdentityCommand::BindCompleted {
                result: Ok(worker),
                ..
            })) = sender.send(cmd).await
            {
                // Nobody is left to own the worker.
                services.transport.unbind(&worker).await;
                worker.mark_closed();
            }
        });
    }

    fn handle_bind_completed(
        &mut self,
        generation: u64,
        result: Result<WorkerHandle, TransportError>,
        completed_at: u64,
    ) {
        match result {
            Ok(worker) => match self.connection.bind_succeeded(generation, worker) {
                Ok(waiters) => {
                    let Some(worker) = self.connection.worker().cloned() else {
                        return;
                    };
                    info!(
                        identity = %self.identity,
                        worker = %worker.id(),
                        waiters = waiters.len(),
                        "Sandbox worker bound"
                    );
                    self.spawn_watcher(&worker);
                    for waiter in waiters {
                        self.resolve_waiter(waiter, &worker, completed_at);
                    }
                    if let Some(listener) = self.start_listener.take() {
                        notify_start(listener.as_ref(), &self.identity);
                    }
                }
                Err(stale) => {
                    debug!(
                        identity = %self.identity,
                        worker = %stale.id(),
                        generation,
                        "Releasing worker from stale bind"
                    );
                    self.release_worker(stale);
                }
            },
            Err(e) => {
                let Some(waiters) = self.connection.bind_failed(generation) else {
                    debug!(identity = %self.identity, generation, "Ignoring stale bind failure");
                    return;
                };
                warn!(identity = %self.identity, error = %e, "Sandbox bind failed");
                let err = SandboxError::worker_unavailable(format!("bind failed: {e}"));
                for waiter in waiters {
                    self.fail_waiter(waiter, err.clone());
                }
            }
        }
    }

    /// Posts a death report once the worker's transport closes.
    fn spawn_watcher(&self, worker: &WorkerHandle) {
        let worker = worker.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            worker.closed().await;
            let _ = sender
                .send(IdentityCommand::WorkerDied {
                    worker: Some(worker.id()),
                })
                .await;
        });
    }

    fn resolve_waiter(&mut self, waiter: BindWaiter, worker: &WorkerHandle, bound_at: u64) {
        match waiter {
            BindWaiter::Caller(tx) => {
                let _ = tx.send(Ok(worker.clone()));
            }
            BindWaiter::Load { module, session } => {
                let Some(s) = self.session_mut(&module, session) else {
                    return;
                };
                if s.state() != LoadState::LoadPending {
                    return;
                }
                s.mark(Hop::BindCompleted, bound_at);
                if self.unloading.get(&module) == Some(&worker.id()) {
                    debug!(identity = %self.identity, module = %module, "Load held until unload is acknowledged");
                    self.held_loads.insert(module, (session, worker.clone()));
                } else {
                    self.dispatch_load(&module, worker.clone());
                }
            }
        }
    }

    fn fail_waiter(&mut self, waiter: BindWaiter, err: SandboxError) {
        match waiter {
            BindWaiter::Caller(tx) => {
                let _ = tx.send(Err(err));
            }
            BindWaiter::Load { module, session } => {
                if let Some(s) = self.session_mut(&module, session) {
                    if let Some(Some(tracker)) = s.fail_load(err) {
                        self.services.fail_call(&self.identity, tracker);
                    }
                }
            }
        }
    }

    /// Hands a worker back to the transport in the background.
    fn release_worker(&self, worker: WorkerHandle) {
        let services = Arc::clone(&self.services);
        tokio::spawn(async move {
            services.transport.unbind(&worker).await;
            worker.mark_closed();
        });
    }

    /// Processes the death of a bound worker the actor has not heard about yet.
    fn reap_if_closed(&mut self) {
        let closed = self
            .connection
            .worker()
            .filter(|w| w.is_closed())
            .map(WorkerHandle::id);
        if let Some(id) = closed {
            self.handle_worker_died(Some(id));
        }
    }

    fn unbind_if_idle(&mut self) {
        if !self.settings.unbind_when_idle
            || self.connection.status() != SandboxStatus::Created
            || self.sessions.values().any(|s| s.state().is_live())
        {
            return;
        }
        let teardown = self.connection.release();
        if let Some(worker) = teardown.worker {
            debug!(identity = %self.identity, worker = %worker.id(), "Releasing idle worker");
            self.release_worker(worker);
        }
    }

    // ========================================================================
    // Loading
    // ========================================================================

    fn handle_load(
        &mut self,
        module: ModuleInfo,
        params: serde_json::Value,
        mut tracker: LatencyTracker,
        reply: oneshot::Sender<Result<LoadedModule, SandboxError>>,
    ) -> Result<(), SandboxError> {
        if let Some(existing) = self.sessions.get(&module.name) {
            if existing.state().is_live() {
                let err = SandboxError::AlreadyLoaded {
                    identity: self.identity.clone(),
                    module: module.name.clone(),
                    pending: existing.state() == LoadState::LoadPending,
                };
                self.reject(tracker, &err);
                return Err(err);
            }
        }

        if self.connection.restart_blocked()
            && self.connection.status() == SandboxStatus::NonExistent
        {
            let err = SandboxError::worker_unavailable(
                "worker died and restart is forbidden until reset",
            );
            self.reject(tracker, &err);
            return Err(err);
        }

        if self.connection.status() != SandboxStatus::Created {
            tracker.mark(Hop::BindStarted, self.services.now());
        }

        self.next_session += 1;
        let id = self.next_session;
        let name = module.name.clone();
        debug!(identity = %self.identity, module = %name, session = id, "Load accepted");

        self.sessions
            .insert(name.clone(), LoadSession::new(id, module, params, reply, tracker));

        let step = self.connection.connect(BindWaiter::Load {
            module: name,
            session: id,
        });
        self.apply_connect_step(step);
        Ok(())
    }

    fn dispatch_load(&mut self, module: &ModuleName, worker: WorkerHandle) {
        let now = self.services.now();
        let Some(session) = self.sessions.get_mut(module) else {
            return;
        };
        let params = match session.begin_load(now) {
            Ok(params) => params,
            Err(e) => {
                warn!(identity = %self.identity, module = %module, error = %e, "Load not dispatched");
                return;
            }
        };

        let request = WorkerRequest::LoadModule {
            module: session.info().clone(),
            params,
        };
        let session_id = session.id();
        let module = module.clone();
        let services = Arc::clone(&self.services);
        let sender = self.sender.clone();

        tokio::spawn(async move {
            let result = services.transport.send(&worker, request).await;
            let resumed_at = services.now();
            let _ = sender
                .send(IdentityCommand::LoadCompleted {
                    module,
                    session: session_id,
                    result,
                    resumed_at,
                })
                .await;
        });
    }

    fn handle_load_completed(
        &mut self,
        module: ModuleName,
        session_id: u64,
        result: Result<WorkerResponse, TransportError>,
        resumed_at: u64,
    ) {
        let Some(session) = self
            .sessions
            .get_mut(&module)
            .filter(|s| s.id() == session_id)
        else {
            debug!(identity = %self.identity, module = %module, "Dropping load result for replaced session");
            return;
        };
        if session.state() != LoadState::LoadPending {
            return;
        }
        session.mark(Hop::FrontendResumed, resumed_at);

        match result {
            Ok(WorkerResponse::Loaded { interface, timings }) => {
                let loaded = LoadedModule {
                    name: module.clone(),
                    interface,
                    loaded_at: Utc::now(),
                };
                if let Some((reply, tracker)) = session.complete_load(loaded.clone()) {
                    info!(identity = %self.identity, module = %module, "Module loaded");
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(loaded));
                    }
                    if let Some(mut tracker) = tracker {
                        tracker.mark_worker(timings);
                        self.services
                            .finish_call(&self.identity, tracker, CallOutcome::Success);
                    }
                }
            }
            Ok(WorkerResponse::LoadFailed {
                code,
                message,
                timings,
            }) => {
                warn!(identity = %self.identity, module = %module, code = %code, message = %message, "Module load failed");
                let err = SandboxError::LoadFailed { code, message };
                if let Some(Some(mut tracker)) = session.fail_load(err) {
                    tracker.mark_worker(timings);
                    self.services.finish_call(
                        &self.identity,
                        tracker,
                        CallOutcome::FailedAt(Stage::WorkerInternal),
                    );
                }
                if code.is_fatal_to_worker() {
                    warn!(identity = %self.identity, "Worker cannot load modules, stopping sandbox");
                    self.stop("worker failed to instantiate its loader");
                } else {
                    self.unbind_if_idle();
                }
            }
            Ok(other) => {
                let err = SandboxError::worker_unavailable(format!(
                    "unexpected {} response to load",
                    other.name()
                ));
                if let Some(Some(tracker)) = session.fail_load(err) {
                    self.services.finish_call(
                        &self.identity,
                        tracker,
                        CallOutcome::FailedAt(Stage::WorkerToFrontend),
                    );
                }
                self.unbind_if_idle();
            }
            Err(e) => {
                debug!(identity = %self.identity, module = %module, error = %e, "Load request failed");
                let err = SandboxError::worker_unavailable(e.to_string());
                if let Some(Some(tracker)) = session.fail_load(err) {
                    self.services.fail_call(&self.identity, tracker);
                }
                self.reap_if_closed();
                self.unbind_if_idle();
            }
        }
    }

    // ========================================================================
    // Unloading
    // ========================================================================

    fn handle_unload(
        &mut self,
        module: ModuleName,
        mut tracker: LatencyTracker,
    ) -> Result<(), SandboxError> {
        let Some(session) = self.sessions.get_mut(&module) else {
            let err = SandboxError::invalid_state(format!("no session for module {module}"));
            self.reject(tracker, &err);
            return Err(err);
        };

        let ended = match session.unload() {
            Ok((true, ended)) => ended,
            Ok((false, _)) => {
                debug!(identity = %self.identity, module = %module, "Unload of finished session ignored");
                self.services
                    .finish_call(&self.identity, tracker, CallOutcome::Success);
                return Ok(());
            }
            Err(err) => {
                self.reject(tracker, &err);
                return Err(err);
            }
        };
        self.finish_ended(ended);
        info!(identity = %self.identity, module = %module, "Module unloaded");

        let Some(worker) = self.connection.worker().cloned() else {
            self.services
                .finish_call(&self.identity, tracker, CallOutcome::Success);
            return Ok(());
        };

        // The caller is answered now; the worker is told in the background.
        let now = self.services.now();
        tracker.mark(Hop::FrontendDispatched, now);
        tracker.mark(Hop::FrontendReplied, now);
        self.unloading.insert(module.clone(), worker.id());

        let services = Arc::clone(&self.services);
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let request = WorkerRequest::UnloadModule {
                module: module.clone(),
            };
            let result = services.transport.send(&worker, request).await;
            let resumed_at = services.now();
            let _ = sender
                .send(IdentityCommand::UnloadCompleted {
                    module,
                    worker: worker.id(),
                    tracker,
                    result,
                    resumed_at,
                })
                .await;
        });
        Ok(())
    }

    fn handle_unload_completed(
        &mut self,
        module: ModuleName,
        worker: WorkerId,
        mut tracker: LatencyTracker,
        result: Result<WorkerResponse, TransportError>,
        resumed_at: u64,
    ) {
        tracker.mark(Hop::FrontendResumed, resumed_at);
        match result {
            Ok(WorkerResponse::Unloaded { timings }) => {
                tracker.mark_worker(timings);
                self.services
                    .finish_call(&self.identity, tracker, CallOutcome::Success);
            }
            Ok(other) => {
                warn!(identity = %self.identity, module = %module, response = other.name(), "Unexpected unload response");
                self.services.finish_call(
                    &self.identity,
                    tracker,
                    CallOutcome::FailedAt(Stage::WorkerToFrontend),
                );
            }
            Err(e) => {
                debug!(identity = %self.identity, module = %module, error = %e, "Unload notification failed");
                self.services.fail_call(&self.identity, tracker);
            }
        }

        if self.unloading.get(&module) == Some(&worker) {
            self.unloading.remove(&module);
            if let Some((session, held)) = self.held_loads.remove(&module) {
                let pending = self
                    .session_mut(&module, session)
                    .is_some_and(|s| s.state() == LoadState::LoadPending);
                if pending {
                    debug!(identity = %self.identity, module = %module, "Releasing held load");
                    self.dispatch_load(&module, held);
                }
            }
        }
        self.unbind_if_idle();
    }

    // ========================================================================
    // Data Sync
    // ========================================================================

    fn handle_sync_data(
        &mut self,
        update: serde_json::Value,
        listener: Option<Arc<dyn SandboxStartListener>>,
        mut tracker: LatencyTracker,
        respond_to: oneshot::Sender<Result<(), SandboxError>>,
    ) {
        let worker = self
            .connection
            .worker()
            .filter(|_| self.connection.status() == SandboxStatus::Created)
            .cloned();
        let Some(worker) = worker else {
            if let Some(listener) = listener {
                debug!(identity = %self.identity, "Keeping listener until the sandbox starts");
                self.start_listener = Some(listener);
            }
            let err = SandboxError::worker_unavailable("sandbox not available");
            self.reject(tracker, &err);
            let _ = respond_to.send(Err(err));
            return;
        };

        tracker.mark(Hop::FrontendDispatched, self.services.now());
        let services = Arc::clone(&self.services);
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = services
                .transport
                .send(&worker, WorkerRequest::SyncData { update })
                .await;
            let resumed_at = services.now();
            let _ = sender
                .send(IdentityCommand::SyncCompleted {
                    tracker,
                    respond_to,
                    result,
                    resumed_at,
                })
                .await;
        });
    }

    fn handle_sync_completed(
        &mut self,
        mut tracker: LatencyTracker,
        respond_to: oneshot::Sender<Result<(), SandboxError>>,
        result: Result<WorkerResponse, TransportError>,
        resumed_at: u64,
    ) {
        tracker.mark(Hop::FrontendResumed, resumed_at);
        let (answer, outcome) = match result {
            Ok(WorkerResponse::DataSynced { timings }) => {
                tracker.mark_worker(timings);
                (Ok(()), CallOutcome::Success)
            }
            Ok(WorkerResponse::RequestFailed { message, timings }) => {
                tracker.mark_worker(timings);
                (
                    Err(SandboxError::invalid_state(message)),
                    CallOutcome::FailedAt(Stage::WorkerInternal),
                )
            }
            Ok(other) => (
                Err(SandboxError::worker_unavailable(format!(
                    "unexpected {} response to data sync",
                    other.name()
                ))),
                CallOutcome::FailedAt(Stage::WorkerToFrontend),
            ),
            Err(e) => (
                Err(SandboxError::worker_unavailable(e.to_string())),
                CallOutcome::FailedAt(tracker.in_flight_stage()),
            ),
        };
        if let Err(e) = &answer {
            debug!(identity = %self.identity, error = %e, "Data sync failed");
        }
        let _ = respond_to.send(answer);
        self.services.finish_call(&self.identity, tracker, outcome);
    }

    // ========================================================================
    // Interface Requests
    // ========================================================================

    fn handle_request_interface(
        &mut self,
        module: ModuleName,
        params: serde_json::Value,
        mut tracker: LatencyTracker,
        reply: oneshot::Sender<Result<serde_json::Value, SandboxError>>,
    ) {
        let loaded = self
            .sessions
            .get(&module)
            .is_some_and(|s| s.state() == LoadState::Loaded);
        let worker = match (loaded, self.connection.worker().cloned()) {
            (true, Some(worker)) => worker,
            _ => {
                let err = SandboxError::NotLoaded { module };
                let _ = reply.send(Err(err.clone()));
                self.reject(tracker, &err);
                return;
            }
        };
        let now = self.services.now();
        let Some(session) = self.sessions.get_mut(&module) else {
            return;
        };

        tracker.mark(Hop::FrontendDispatched, now);
        let request = session.add_request(reply, tracker);
        let session_id = session.id();

        let services = Arc::clone(&self.services);
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let call = WorkerRequest::RequestInterface {
                module: module.clone(),
                params,
            };
            let result = services.transport.send(&worker, call).await;
            let resumed_at = services.now();
            let _ = sender
                .send(IdentityCommand::InterfaceCompleted {
                    module,
                    session: session_id,
                    request,
                    result,
                    resumed_at,
                })
                .await;
        });
    }

    fn handle_interface_completed(
        &mut self,
        module: ModuleName,
        session_id: u64,
        request: u64,
        result: Result<WorkerResponse, TransportError>,
        resumed_at: u64,
    ) {
        let Some((reply, mut tracker)) = self
            .session_mut(&module, session_id)
            .and_then(|s| s.take_request(request))
        else {
            // Already answered by an unload or a death.
            return;
        };
        tracker.mark(Hop::FrontendResumed, resumed_at);

        let (answer, outcome) = match result {
            Ok(WorkerResponse::Interface { payload, timings }) => {
                tracker.mark_worker(timings);
                (Ok(payload), CallOutcome::Success)
            }
            Ok(WorkerResponse::RequestFailed { message, timings }) => {
                tracker.mark_worker(timings);
                (
                    Err(SandboxError::RequestFailed {
                        module: module.clone(),
                        message,
                    }),
                    CallOutcome::FailedAt(Stage::WorkerInternal),
                )
            }
            Ok(other) => (
                Err(SandboxError::worker_unavailable(format!(
                    "unexpected {} response to interface request",
                    other.name()
                ))),
                CallOutcome::FailedAt(Stage::WorkerToFrontend),
            ),
            Err(e) => (
                Err(SandboxError::worker_unavailable(e.to_string())),
                CallOutcome::FailedAt(tracker.in_flight_stage()),
            ),
        };

        let _ = reply.send(answer);
        self.services.finish_call(&self.identity, tracker, outcome);
    }

    // ========================================================================
    // Death and Teardown
    // ========================================================================

    fn handle_worker_died(&mut self, worker: Option<WorkerId>) {
        let Some(teardown) = self.connection.on_death(worker) else {
            debug!(identity = %self.identity, "Ignoring death report for a worker that is not bound");
            return;
        };

        let death_generation = self.connection.death_generation();
        warn!(
            identity = %self.identity,
            death_generation,
            restart_blocked = self.connection.restart_blocked(),
            "Sandbox worker died"
        );

        let mut loaded: Vec<ModuleName> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state() == LoadState::Loaded)
            .map(|(name, _)| name.clone())
            .collect();
        loaded.sort();

        self.teardown(teardown, SandboxError::worker_unavailable("worker died"));

        let report = self.services.notifier.notify(&self.identity);
        self.services
            .telemetry
            .record_death(&self.identity, death_generation, report.invoked);

        // Nobody can tell the client its interfaces are gone.
        if report.invoked == 0 && !loaded.is_empty() {
            report_orphan(self.services.orphans.as_ref(), &self.identity, &loaded);
        }
    }

    /// Tears the sandbox down on purpose. Returns true if anything was live.
    fn stop(&mut self, reason: &str) -> bool {
        let teardown = self.connection.release();
        let live = teardown.worker.is_some()
            || !teardown.waiters.is_empty()
            || self.sessions.values().any(|s| s.state().is_live());

        self.teardown(teardown, SandboxError::worker_unavailable(reason));
        if live {
            info!(identity = %self.identity, reason, "Sandbox stopped");
        }
        live
    }

    /// Fails everything that depended on the torn-down binding.
    fn teardown(&mut self, teardown: Teardown, err: SandboxError) {
        self.unloading.clear();
        self.held_loads.clear();
        for waiter in teardown.waiters {
            self.fail_waiter(waiter, err.clone());
        }

        let mut ended = Vec::new();
        for session in self.sessions.values_mut() {
            let (load, requests) = session.terminate(err.clone());
            ended.extend(load);
            ended.extend(requests);
        }
        self.finish_ended(ended);

        if let Some(worker) = teardown.worker {
            self.release_worker(worker);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn snapshot(&self) -> SandboxView {
        let mut sessions: Vec<_> = self.sessions.values().map(LoadSession::view).collect();
        sessions.sort_by(|a, b| a.module.cmp(&b.module));

        SandboxView {
            identity: self.identity.clone(),
            status: self.connection.status(),
            restart_blocked: self.connection.restart_blocked(),
            death_generation: self.connection.death_generation(),
            pending_waiters: self.connection.waiter_count(),
            death_callbacks: self.services.notifier.count(&self.identity),
            sessions,
        }
    }

    fn loaded_modules(&self) -> Vec<LoadedModule> {
        let mut modules: Vec<LoadedModule> = self
            .sessions
            .values()
            .filter(|s| s.state() == LoadState::Loaded)
            .filter_map(|s| s.loaded().cloned())
            .collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        modules
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn session_mut(&mut self, module: &ModuleName, id: u64) -> Option<&mut LoadSession> {
        self.sessions.get_mut(module).filter(|s| s.id() == id)
    }

    /// Reports a call refused before it reached the worker.
    fn reject(&self, tracker: LatencyTracker, err: &SandboxError) {
        debug!(identity = %self.identity, call = %tracker.kind(), error = %err, "Call rejected");
        self.services.finish_call(
            &self.identity,
            tracker,
            CallOutcome::FailedAt(Stage::FrontendToApp),
        );
    }

    fn finish_ended(&self, ended: Vec<LatencyTracker>) {
        for tracker in ended {
            self.services.fail_call(&self.identity, tracker);
        }
    }
}
