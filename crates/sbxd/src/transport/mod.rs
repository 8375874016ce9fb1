//! Transport seam between the manager and sandbox worker processes.
//!
//! The manager never talks to a worker directly. It asks a
//! [`WorkerTransport`] to bind a worker for a client, to deliver requests to
//! it, and to release it. Transports report a worker's abrupt exit by
//! closing its [`WorkerHandle`]; the manager watches every handle it holds.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Transport failures surface as `TransportError` values

mod process;

pub use process::ProcessTransport;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use sbx_core::ClientIdentity;
use sbx_protocol::{WorkerRequest, WorkerResponse};

/// Identifier a transport assigns to each worker it binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Handle to one bound worker.
///
/// Cheap to clone. Every clone observes the same closed flag, which the
/// transport sets when the worker goes away for any reason.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    identity: ClientIdentity,
    closed: CancellationToken,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, identity: ClientIdentity) -> Self {
        Self {
            id,
            identity,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Returns true once the worker has exited or been released.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Marks the worker as gone. Called by transports.
    pub fn mark_closed(&self) {
        self.closed.cancel();
    }

    /// Resolves when the worker is gone.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl PartialEq for WorkerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WorkerHandle {}

/// Errors a transport can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to bind worker: {0}")]
    Bind(String),

    #[error("worker disconnected")]
    Disconnected,

    #[error("worker request timed out after {0:?}")]
    Timeout(Duration),

    #[error("worker protocol error: {0}")]
    Protocol(String),

    #[error("worker I/O error: {0}")]
    Io(String),
}

/// Binds, drives and releases sandbox workers.
#[async_trait]
pub trait WorkerTransport: Send + Sync + 'static {
    /// Starts (or connects to) a worker for `identity`.
    async fn bind(&self, identity: &ClientIdentity) -> Result<WorkerHandle, TransportError>;

    /// Delivers one request and waits for the worker's answer.
    async fn send(
        &self,
        worker: &WorkerHandle,
        request: WorkerRequest,
    ) -> Result<WorkerResponse, TransportError>;

    /// Releases a worker. Must close the handle and must not fail.
    async fn unbind(&self, worker: &WorkerHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_clones_share_closed_flag() {
        let handle = WorkerHandle::new(WorkerId::new(4), ClientIdentity::new(1, "a"));
        let clone = handle.clone();
        assert!(!clone.is_closed());

        handle.mark_closed();
        assert!(clone.is_closed());

        // Already closed: resolves immediately.
        clone.closed().await;
    }

    #[test]
    fn test_handle_equality_is_by_id() {
        let a = WorkerHandle::new(WorkerId::new(1), ClientIdentity::new(1, "a"));
        let b = WorkerHandle::new(WorkerId::new(1), ClientIdentity::new(2, "b"));
        let c = WorkerHandle::new(WorkerId::new(2), ClientIdentity::new(1, "a"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(c.id().to_string(), "worker-2");
    }
}
