//! Worker transport backed by child processes.
//!
//! Each bind spawns the configured worker command with the client identity
//! in its environment, then speaks JSON-lines frames over the child's stdin
//! and stdout:
//!
//! ```text
//!            RequestFrame (stdin)
//! manager ───────────────────────▶ sbx-worker
//!    ▲                                 │
//!    │     ResponseFrame (stdout)      │
//!    └──────── reader task ◀───────────┘
//! ```
//!
//! The reader task routes responses to waiting callers by `request_id`.
//! When stdout reaches EOF the worker is considered dead: pending calls
//! fail with `Disconnected` and the worker handle is closed. A call that
//! times out drops its routing entry; a late reply to it is discarded.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use sbx_core::ClientIdentity;
use sbx_protocol::{
    ProtocolVersion, RequestFrame, ResponseFrame, WorkerRequest, WorkerResponse,
};

use super::{TransportError, WorkerHandle, WorkerId, WorkerTransport};
use crate::config::WorkerConfig;

/// Maximum frame size accepted from a worker (1 MB)
const MAX_FRAME_SIZE: usize = 1_048_576;

type PendingMap = std::sync::Mutex<HashMap<u64, oneshot::Sender<WorkerResponse>>>;

/// One running worker process.
struct WorkerProcess {
    handle: WorkerHandle,
    stdin: Mutex<BufWriter<ChildStdin>>,
    child: Mutex<Child>,
    pending: PendingMap,
    next_request: AtomicU64,
}

impl WorkerProcess {
    /// Writes one request and waits up to `deadline` for the matching response.
    async fn call(
        &self,
        request: WorkerRequest,
        deadline: Duration,
    ) -> Result<WorkerResponse, TransportError> {
        if self.handle.is_closed() {
            return Err(TransportError::Disconnected);
        }

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = RequestFrame {
            request_id,
            request,
        };
        let line =
            serde_json::to_string(&frame).map_err(|e| TransportError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, tx);

        // The reader closes the handle before clearing `pending`; an insert
        // that raced past the clear is caught here.
        if self.handle.is_closed() {
            self.forget(request_id);
            return Err(TransportError::Disconnected);
        }

        let exchange = async {
            let written = {
                let mut stdin = self.stdin.lock().await;
                async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await
            };

            if let Err(e) = written {
                self.forget(request_id);
                return Err(if self.handle.is_closed() {
                    TransportError::Disconnected
                } else {
                    TransportError::Io(e.to_string())
                });
            }

            // Sender dropped means the reader task hit EOF.
            rx.await.map_err(|_| TransportError::Disconnected)
        };

        match timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => {
                self.forget(request_id);
                Err(TransportError::Timeout(deadline))
            }
        }
    }

    fn forget(&self, request_id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id);
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn kill(&self) {
        self.handle.mark_closed();
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            debug!(worker = %self.handle.id(), error = %e, "Worker already exited");
        }
        // Reap so the child does not linger as a zombie.
        let _ = child.wait().await;
    }
}

/// Spawns worker processes from a [`WorkerConfig`].
pub struct ProcessTransport {
    config: WorkerConfig,
    next_worker: AtomicU64,
    workers: std::sync::Mutex<HashMap<WorkerId, Arc<WorkerProcess>>>,
}

impl ProcessTransport {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            next_worker: AtomicU64::new(1),
            workers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Number of workers currently bound.
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn lookup(&self, id: WorkerId) -> Option<Arc<WorkerProcess>> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn spawn_child(&self, identity: &ClientIdentity) -> Result<Child, TransportError> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| TransportError::Bind("worker command is empty".to_string()))?;

        Command::new(program)
            .args(args)
            .env("SBX_CLIENT_UID", identity.owner_uid.to_string())
            .env("SBX_CLIENT_PACKAGE", &identity.package_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Bind(format!("failed to spawn {program}: {e}")))
    }

    async fn handshake(
        &self,
        process: &WorkerProcess,
        identity: &ClientIdentity,
    ) -> Result<(), TransportError> {
        let request = WorkerRequest::Initialize {
            protocol_version: ProtocolVersion::CURRENT,
            identity: identity.clone(),
        };

        let response = process.call(request, self.config.ready_timeout()).await?;

        match response {
            WorkerResponse::Ready { protocol_version } => protocol_version
                .ensure_current_compatible()
                .map_err(|e| TransportError::Protocol(e.to_string())),
            other => Err(TransportError::Protocol(format!(
                "expected ready, worker sent {}",
                other.name()
            ))),
        }
    }
}

#[async_trait]
impl WorkerTransport for ProcessTransport {
    async fn bind(&self, identity: &ClientIdentity) -> Result<WorkerHandle, TransportError> {
        let mut child = self.spawn_child(identity)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Bind("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Bind("worker stdout not captured".to_string()))?;

        let id = WorkerId::new(self.next_worker.fetch_add(1, Ordering::Relaxed));
        let handle = WorkerHandle::new(id, identity.clone());
        let pid = child.id();

        let process = Arc::new(WorkerProcess {
            handle: handle.clone(),
            stdin: Mutex::new(BufWriter::new(stdin)),
            child: Mutex::new(child),
            pending: std::sync::Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
        });

        spawn_reader(Arc::clone(&process), stdout);

        if let Err(e) = self.handshake(&process, identity).await {
            warn!(identity = %identity, worker = %id, error = %e, "Worker handshake failed");
            process.kill().await;
            return Err(TransportError::Bind(e.to_string()));
        }

        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, process);

        info!(identity = %identity, worker = %id, pid = ?pid, "Worker process bound");
        Ok(handle)
    }

    async fn send(
        &self,
        worker: &WorkerHandle,
        request: WorkerRequest,
    ) -> Result<WorkerResponse, TransportError> {
        let process = self
            .lookup(worker.id())
            .ok_or(TransportError::Disconnected)?;

        let name = request.name();
        let result = process.call(request, self.config.request_timeout()).await;
        if let Err(TransportError::Timeout(after)) = &result {
            warn!(worker = %worker.id(), request = name, after = ?after, "Worker request timed out");
        }
        result
    }

    async fn unbind(&self, worker: &WorkerHandle) {
        let process = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&worker.id());

        match process {
            Some(process) => {
                // Best effort: a worker that is already gone cannot acknowledge.
                if !process.handle.is_closed() {
                    let _ = process
                        .call(WorkerRequest::Shutdown, self.config.ready_timeout())
                        .await;
                }
                process.kill().await;
                info!(worker = %worker.id(), "Worker process released");
            }
            None => {
                worker.mark_closed();
                debug!(worker = %worker.id(), "Unbind of unknown worker");
            }
        }
    }
}

/// Reads response frames until the worker's stdout closes.
fn spawn_reader(process: Arc<WorkerProcess>, stdout: ChildStdout) {
    tokio::spawn(async move {
        let mut frames =
            FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_FRAME_SIZE));
        let mut skipped = false;

        loop {
            match frames.next().await {
                Some(Ok(line)) => {
                    skipped = false;
                    route_frame(&process, &line);
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(worker = %process.handle.id(), max = MAX_FRAME_SIZE, "Oversized worker frame dropped");
                    skipped = true;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    warn!(worker = %process.handle.id(), error = %e, "Worker stdout read failed");
                    break;
                }
                // A decode error is followed by one `None` before the stream resumes.
                None if skipped => skipped = false,
                None => break,
            }
        }

        process.handle.mark_closed();
        // Dropping the senders fails every in-flight call with Disconnected.
        process
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        debug!(worker = %process.handle.id(), "Worker stdout closed");
    });
}

fn route_frame(process: &WorkerProcess, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let frame: ResponseFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(worker = %process.handle.id(), error = %e, "Unparseable worker frame");
            return;
        }
    };

    let waiter = process
        .pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&frame.request_id);

    match waiter {
        Some(tx) => {
            let _ = tx.send(frame.response);
        }
        None => debug!(
            worker = %process.handle.id(),
            request_id = frame.request_id,
            "Response for unknown request"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_with_missing_program_fails() {
        let transport = ProcessTransport::new(WorkerConfig {
            command: vec!["/nonexistent/sbx-worker-binary".to_string()],
            ..WorkerConfig::default()
        });

        let err = transport
            .bind(&ClientIdentity::new(1000, "com.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Bind(_)));
        assert_eq!(transport.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_that_never_answers_times_out() {
        // `sleep` never writes a ready frame.
        let transport = ProcessTransport::new(WorkerConfig {
            command: vec!["sleep".to_string(), "5".to_string()],
            ready_timeout_ms: 50,
            ..WorkerConfig::default()
        });

        let err = transport
            .bind(&ClientIdentity::new(1000, "com.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Bind(_)));
    }

    const READY_FRAME: &str =
        r#"{"request_id":1,"type":"ready","protocol_version":{"major":1,"minor":0}}"#;

    /// A worker that answers the handshake with `preamble` printed first,
    /// then reads requests without ever answering.
    fn silent_worker(preamble: &str) -> Vec<String> {
        let script = format!(
            "read line; {preamble} echo '{READY_FRAME}'; while read line; do :; done"
        );
        vec!["sh".to_string(), "-c".to_string(), script]
    }

    #[tokio::test]
    async fn test_timed_out_request_is_forgotten() {
        let transport = ProcessTransport::new(WorkerConfig {
            command: silent_worker(""),
            ready_timeout_ms: 2_000,
            request_timeout_ms: 50,
            ..WorkerConfig::default()
        });
        let worker = transport
            .bind(&ClientIdentity::new(1000, "com.example"))
            .await
            .expect("handshake answered");
        let process = transport.lookup(worker.id()).unwrap();

        for _ in 0..3 {
            let err = transport
                .send(
                    &worker,
                    WorkerRequest::UnloadModule {
                        module: "ads".into(),
                    },
                )
                .await
                .unwrap_err();
            assert_eq!(err, TransportError::Timeout(Duration::from_millis(50)));
        }
        assert_eq!(process.pending_count(), 0);
        assert!(!worker.is_closed());

        process.kill().await;
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped() {
        let oversized = format!("head -c {} /dev/zero | tr '\\0' x; echo;", MAX_FRAME_SIZE + 10);
        let transport = ProcessTransport::new(WorkerConfig {
            command: silent_worker(&oversized),
            ready_timeout_ms: 5_000,
            ..WorkerConfig::default()
        });

        let worker = transport
            .bind(&ClientIdentity::new(1000, "com.example"))
            .await
            .expect("ready frame after the oversized line still arrives");
        assert!(!worker.is_closed());

        let process = transport.lookup(worker.id()).unwrap();
        process.kill().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_worker_is_disconnected() {
        let transport = ProcessTransport::new(WorkerConfig::default());
        let stray = WorkerHandle::new(WorkerId::new(99), ClientIdentity::new(1, "a"));

        let err = transport
            .send(&stray, WorkerRequest::Shutdown)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Disconnected);

        transport.unbind(&stray).await;
        assert!(stray.is_closed());
    }
}
