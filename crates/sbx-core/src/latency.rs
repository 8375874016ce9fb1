//! Latency stage vocabulary shared by the manager and telemetry sinks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of logical call being timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    LoadModule,
    UnloadModule,
    RequestInterface,
    AddDeathCallback,
    RemoveDeathCallback,
    SyncData,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LoadModule => "load_module",
            Self::UnloadModule => "unload_module",
            Self::RequestInterface => "request_interface",
            Self::AddDeathCallback => "add_death_callback",
            Self::RemoveDeathCallback => "remove_death_callback",
            Self::SyncData => "sync_data",
        };
        f.write_str(name)
    }
}

/// A point in time a call passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hop {
    /// The client issued the call (reported by the client)
    AppCalled,
    /// The manager accepted the call
    FrontendReceived,
    /// The manager started binding a cold worker
    BindStarted,
    /// The cold worker finished binding
    BindCompleted,
    /// The manager handed the request to the transport
    FrontendDispatched,
    /// The worker received the request (reported by the worker)
    WorkerReceived,
    /// The worker finished handling the request (reported by the worker)
    WorkerCompleted,
    /// The worker's reply reached the manager
    FrontendResumed,
    /// The manager replied to the client
    FrontendReplied,
}

/// A measured stage between two hops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AppToFrontend,
    FrontendToWorkerBind,
    FrontendToWorkerDispatch,
    WorkerInternal,
    WorkerToFrontend,
    FrontendToApp,
}

impl Stage {
    /// Stages in the order a call traverses them.
    pub const PIPELINE: [Stage; 6] = [
        Stage::AppToFrontend,
        Stage::FrontendToWorkerBind,
        Stage::FrontendToWorkerDispatch,
        Stage::WorkerInternal,
        Stage::WorkerToFrontend,
        Stage::FrontendToApp,
    ];

    /// The hops that open and close this stage.
    pub fn bounds(&self) -> (Hop, Hop) {
        match self {
            Self::AppToFrontend => (Hop::AppCalled, Hop::FrontendReceived),
            Self::FrontendToWorkerBind => (Hop::BindStarted, Hop::BindCompleted),
            Self::FrontendToWorkerDispatch => (Hop::FrontendDispatched, Hop::WorkerReceived),
            Self::WorkerInternal => (Hop::WorkerReceived, Hop::WorkerCompleted),
            Self::WorkerToFrontend => (Hop::WorkerCompleted, Hop::FrontendResumed),
            Self::FrontendToApp => (Hop::FrontendResumed, Hop::FrontendReplied),
        }
    }

    /// True for stages that involve the worker process.
    pub fn crosses_worker(&self) -> bool {
        !matches!(self, Self::AppToFrontend | Self::FrontendToApp)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AppToFrontend => "app_to_frontend",
            Self::FrontendToWorkerBind => "frontend_to_worker_bind",
            Self::FrontendToWorkerDispatch => "frontend_to_worker_dispatch",
            Self::WorkerInternal => "worker_internal",
            Self::WorkerToFrontend => "worker_to_frontend",
            Self::FrontendToApp => "frontend_to_app",
        };
        f.write_str(name)
    }
}

/// One stage measurement handed to the telemetry sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySample {
    pub kind: CallKind,
    pub stage: Stage,
    pub duration_micros: u64,
    pub success: bool,
    /// The opening timestamp was never reported, so the duration is zero
    pub unknown: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_hops_chain() {
        // Each stage after the bind detour opens where an earlier one closed.
        let (_, received) = Stage::AppToFrontend.bounds();
        assert_eq!(received, Hop::FrontendReceived);

        let (_, worker_received) = Stage::FrontendToWorkerDispatch.bounds();
        let (internal_start, worker_done) = Stage::WorkerInternal.bounds();
        assert_eq!(worker_received, internal_start);

        let (back_start, resumed) = Stage::WorkerToFrontend.bounds();
        assert_eq!(worker_done, back_start);
        assert_eq!(Stage::FrontendToApp.bounds().0, resumed);
    }

    #[test]
    fn test_only_edges_stay_in_frontend() {
        let crossing: Vec<_> = Stage::PIPELINE
            .iter()
            .filter(|s| s.crosses_worker())
            .collect();
        assert_eq!(crossing.len(), 4);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::WorkerInternal.to_string(), "worker_internal");
        assert_eq!(CallKind::LoadModule.to_string(), "load_module");
    }
}
