//! Lifecycle of one module load.
//!
//! ```text
//! LoadPending ──loaded──▶ Loaded ──unload / death──▶ Unloaded
//!      │
//!      └──failed / death──▶ LoadFailed
//! ```
//!
//! A session is single-use: once it reaches `LoadFailed` or `Unloaded` the
//! next load of the same module creates a fresh one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;

use sbx_core::{
    Hop, LoadState, LoadedModule, ModuleInfo, ModuleName, SandboxError, SessionView,
};

use crate::latency::LatencyTracker;

/// Reply channel of a load call.
pub type LoadReply = oneshot::Sender<Result<LoadedModule, SandboxError>>;

/// Reply channel of an interface request.
pub type InterfaceReply = oneshot::Sender<Result<Value, SandboxError>>;

#[derive(Debug)]
struct InterfaceCall {
    reply: InterfaceReply,
    tracker: LatencyTracker,
}

/// One load of one module for one client.
#[derive(Debug)]
pub struct LoadSession {
    module: ModuleInfo,
    id: u64,
    state: LoadState,
    dispatched: bool,
    params: Value,
    requested_at: DateTime<Utc>,
    loaded: Option<LoadedModule>,
    last_error: Option<SandboxError>,
    reply: Option<LoadReply>,
    tracker: Option<LatencyTracker>,
    next_request: u64,
    requests: HashMap<u64, InterfaceCall>,
}

impl LoadSession {
    pub fn new(
        id: u64,
        module: ModuleInfo,
        params: Value,
        reply: LoadReply,
        tracker: LatencyTracker,
    ) -> Self {
        Self {
            module,
            id,
            state: LoadState::LoadPending,
            dispatched: false,
            params,
            requested_at: Utc::now(),
            loaded: None,
            last_error: None,
            reply: Some(reply),
            tracker: Some(tracker),
            next_request: 0,
            requests: HashMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &ModuleName {
        &self.module.name
    }

    pub fn info(&self) -> &ModuleInfo {
        &self.module
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn loaded(&self) -> Option<&LoadedModule> {
        self.loaded.as_ref()
    }

    /// Stamps a hop on the in-flight load call.
    pub fn mark(&mut self, hop: Hop, at: u64) {
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.mark(hop, at);
        }
    }

    /// Hands out the load parameters for the one dispatch this session gets.
    pub fn begin_load(&mut self, now: u64) -> Result<Value, SandboxError> {
        if self.state != LoadState::LoadPending || self.dispatched {
            return Err(SandboxError::invalid_state("session already used"));
        }
        self.dispatched = true;
        self.mark(Hop::FrontendDispatched, now);
        Ok(std::mem::take(&mut self.params))
    }

    /// Moves to `Loaded` and returns the reply and tracker of the load call.
    ///
    /// Returns `None` if the session is no longer pending.
    pub fn complete_load(
        &mut self,
        module: LoadedModule,
    ) -> Option<(Option<LoadReply>, Option<LatencyTracker>)> {
        if self.state != LoadState::LoadPending {
            return None;
        }
        self.state = LoadState::Loaded;
        self.loaded = Some(module);
        Some((self.reply.take(), self.tracker.take()))
    }

    /// Moves to `LoadFailed` and answers the load call with `error`.
    ///
    /// Returns the tracker of the load call, or `None` if the session was
    /// no longer pending.
    pub fn fail_load(&mut self, error: SandboxError) -> Option<Option<LatencyTracker>> {
        if self.state != LoadState::LoadPending {
            return None;
        }
        self.state = LoadState::LoadFailed;
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(error.clone()));
        }
        self.last_error = Some(error);
        Some(self.tracker.take())
    }

    /// Unloads a loaded session.
    ///
    /// Interface requests still in flight are failed and their trackers
    /// returned. The flag is true if the session was loaded, false if it
    /// was already terminal.
    pub fn unload(&mut self) -> Result<(bool, Vec<LatencyTracker>), SandboxError> {
        match self.state {
            LoadState::LoadPending => Err(SandboxError::invalid_state(format!(
                "cannot unload {} while its load is pending",
                self.module.name
            ))),
            LoadState::Loaded => {
                self.state = LoadState::Unloaded;
                let error = SandboxError::NotLoaded {
                    module: self.module.name.clone(),
                };
                Ok((true, self.fail_requests(error)))
            }
            LoadState::LoadFailed | LoadState::Unloaded => Ok((false, Vec::new())),
        }
    }

    /// Ends the session because its worker is gone.
    ///
    /// A pending load fails, a loaded module becomes unloaded, and every
    /// in-flight call is answered with `error`. Returns the load tracker,
    /// if the load was still pending, and those of the ended interface calls.
    pub fn terminate(&mut self, error: SandboxError) -> (Option<LatencyTracker>, Vec<LatencyTracker>) {
        let load = match self.state {
            LoadState::LoadPending => self.fail_load(error.clone()).flatten(),
            LoadState::Loaded => {
                self.state = LoadState::Unloaded;
                None
            }
            LoadState::LoadFailed | LoadState::Unloaded => None,
        };
        (load, self.fail_requests(error))
    }

    /// Registers an interface request and returns its id.
    pub fn add_request(&mut self, reply: InterfaceReply, tracker: LatencyTracker) -> u64 {
        self.next_request += 1;
        self.requests
            .insert(self.next_request, InterfaceCall { reply, tracker });
        self.next_request
    }

    /// Removes a finished interface request.
    pub fn take_request(&mut self, request: u64) -> Option<(InterfaceReply, LatencyTracker)> {
        self.requests
            .remove(&request)
            .map(|call| (call.reply, call.tracker))
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            module: self.module.name.clone(),
            state: self.state,
            requested_at: self.requested_at,
            loaded_at: self.loaded.as_ref().map(|m| m.loaded_at),
            last_error: self.last_error.as_ref().map(ToString::to_string),
            pending_requests: self.requests.len(),
        }
    }

    fn fail_requests(&mut self, error: SandboxError) -> Vec<LatencyTracker> {
        self.requests
            .drain()
            .map(|(_, call)| {
                let _ = call.reply.send(Err(error.clone()));
                call.tracker
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_core::{CallKind, ModuleInterface};

    fn session() -> (LoadSession, oneshot::Receiver<Result<LoadedModule, SandboxError>>) {
        let (tx, rx) = oneshot::channel();
        let tracker = LatencyTracker::start(CallKind::LoadModule, 0, None);
        let session = LoadSession::new(
            1,
            ModuleInfo::new("ads", "libads.so"),
            serde_json::json!({"k": 1}),
            tx,
            tracker,
        );
        (session, rx)
    }

    fn loaded() -> LoadedModule {
        LoadedModule {
            name: ModuleName::new("ads"),
            interface: ModuleInterface::new("ads-1"),
            loaded_at: Utc::now(),
        }
    }

    #[test]
    fn test_begin_load_is_single_use() {
        let (mut s, _rx) = session();
        assert_eq!(s.begin_load(1).unwrap(), serde_json::json!({"k": 1}));
        assert!(matches!(
            s.begin_load(2),
            Err(SandboxError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_complete_load_hands_back_reply() {
        let (mut s, _rx) = session();
        s.begin_load(1).unwrap();

        let (reply, tracker) = s.complete_load(loaded()).unwrap();
        assert!(reply.is_some());
        assert!(tracker.unwrap().has(Hop::FrontendDispatched));
        assert_eq!(s.state(), LoadState::Loaded);

        // A late second completion is ignored.
        assert!(s.complete_load(loaded()).is_none());
    }

    #[tokio::test]
    async fn test_fail_load_answers_caller() {
        let (mut s, rx) = session();
        s.fail_load(SandboxError::worker_unavailable("bind failed"))
            .unwrap();

        assert_eq!(s.state(), LoadState::LoadFailed);
        assert!(matches!(
            rx.await.unwrap(),
            Err(SandboxError::WorkerUnavailable { .. })
        ));
        assert!(s.view().last_error.is_some());
    }

    #[test]
    fn test_unload_while_pending_is_rejected() {
        let (mut s, _rx) = session();
        assert!(matches!(s.unload(), Err(SandboxError::InvalidState { .. })));
        assert_eq!(s.state(), LoadState::LoadPending);
    }

    #[tokio::test]
    async fn test_unload_fails_in_flight_requests() {
        let (mut s, _rx) = session();
        s.complete_load(loaded()).unwrap();

        let (tx, rx) = oneshot::channel();
        s.add_request(tx, LatencyTracker::start(CallKind::RequestInterface, 0, None));
        assert_eq!(s.pending_requests(), 1);

        let (was_loaded, ended) = s.unload().unwrap();
        assert!(was_loaded);
        assert_eq!(ended.len(), 1);
        assert!(matches!(rx.await.unwrap(), Err(SandboxError::NotLoaded { .. })));

        // Second unload is a no-op.
        let (was_loaded, ended) = s.unload().unwrap();
        assert!(!was_loaded);
        assert!(ended.is_empty());
    }

    #[test]
    fn test_terminate_pending_fails_load() {
        let (mut s, _rx) = session();
        s.begin_load(1).unwrap();

        let (load, ended) = s.terminate(SandboxError::worker_unavailable("died"));
        assert!(load.is_some());
        assert!(ended.is_empty());
        assert_eq!(s.state(), LoadState::LoadFailed);
    }

    #[test]
    fn test_terminate_loaded_unloads() {
        let (mut s, _rx) = session();
        s.complete_load(loaded()).unwrap();

        let (load, _) = s.terminate(SandboxError::worker_unavailable("died"));
        assert!(load.is_none());
        assert_eq!(s.state(), LoadState::Unloaded);
        assert!(s.view().loaded_at.is_some());
    }

    #[test]
    fn test_take_request_once() {
        let (mut s, _rx) = session();
        let (tx, _rx2) = oneshot::channel();
        let id = s.add_request(tx, LatencyTracker::start(CallKind::RequestInterface, 0, None));

        assert!(s.take_request(id).is_some());
        assert!(s.take_request(id).is_none());
    }
}
