//! sbx-worker - reference sandbox worker process.
//!
//! Speaks the worker protocol on stdin/stdout: one JSON `RequestFrame` per
//! input line, one `ResponseFrame` per output line. Logs go to stderr.
//!
//! Modules are not executed; a loaded module answers interface requests by
//! echoing them back along with the data the client synced. Load parameters
//! understood for diagnostics:
//!
//! - `{"fail": "<code>"}` fails the load with that `LoadErrorCode`
//! - `{"crash": true}` exits the process without answering

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Stdout};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sbx_core::{LoadErrorCode, ModuleInfo, ModuleInterface, ModuleName};
use sbx_protocol::{
    ProtocolVersion, RequestFrame, ResponseFrame, WorkerRequest, WorkerResponse, WorkerTimings,
};

/// Exit code used by the `crash` diagnostic
const CRASH_EXIT_CODE: i32 = 70;

fn now_micros() -> u64 {
    u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0)
}

/// What a request does to the worker besides its response.
enum Next {
    Continue,
    Exit,
    Crash,
}

/// Modules loaded in this worker.
#[derive(Default)]
struct Worker {
    client: Option<String>,
    modules: HashMap<ModuleName, ModuleInterface>,
    loads: u64,
    /// Client data shared with every module. A null value deletes its key.
    data: Map<String, Value>,
}

impl Worker {
    fn handle(&mut self, request: WorkerRequest) -> (Option<WorkerResponse>, Next) {
        let received_at = Some(now_micros());
        let timings = || WorkerTimings {
            received_at,
            completed_at: Some(now_micros()),
        };

        match request {
            WorkerRequest::Initialize {
                protocol_version,
                identity,
            } => {
                if !protocol_version.is_compatible_with(&ProtocolVersion::CURRENT) {
                    warn!(version = %protocol_version, "Incompatible manager protocol");
                }
                info!(identity = %identity, "Worker initialized");
                self.client = Some(identity.to_string());
                (
                    Some(WorkerResponse::Ready {
                        protocol_version: ProtocolVersion::CURRENT,
                    }),
                    Next::Continue,
                )
            }

            WorkerRequest::LoadModule { module, params } => {
                if params.get("crash").and_then(Value::as_bool) == Some(true) {
                    warn!(module = %module.name, "Crashing on request");
                    return (None, Next::Crash);
                }
                let response = match self.load(module, &params) {
                    Ok(interface) => WorkerResponse::Loaded {
                        interface,
                        timings: timings(),
                    },
                    Err((code, message)) => WorkerResponse::LoadFailed {
                        code,
                        message,
                        timings: timings(),
                    },
                };
                (Some(response), Next::Continue)
            }

            WorkerRequest::UnloadModule { module } => {
                if self.modules.remove(&module).is_some() {
                    info!(module = %module, "Module unloaded");
                }
                (
                    Some(WorkerResponse::Unloaded { timings: timings() }),
                    Next::Continue,
                )
            }

            WorkerRequest::RequestInterface { module, params } => {
                let response = match self.modules.get(&module) {
                    Some(interface) => WorkerResponse::Interface {
                        payload: json!({
                            "module": module,
                            "token": interface.token,
                            "echo": params,
                            "data": self.data,
                        }),
                        timings: timings(),
                    },
                    None => WorkerResponse::RequestFailed {
                        message: format!("module {module} is not loaded in this worker"),
                        timings: timings(),
                    },
                };
                (Some(response), Next::Continue)
            }

            WorkerRequest::SyncData { update } => {
                let response = match update {
                    Value::Object(update) => {
                        for (key, value) in update {
                            if value.is_null() {
                                self.data.remove(&key);
                            } else {
                                self.data.insert(key, value);
                            }
                        }
                        debug!(keys = self.data.len(), "Client data synced");
                        WorkerResponse::DataSynced { timings: timings() }
                    }
                    other => WorkerResponse::RequestFailed {
                        message: format!("data update must be an object, got {other}"),
                        timings: timings(),
                    },
                };
                (Some(response), Next::Continue)
            }

            WorkerRequest::Shutdown => (Some(WorkerResponse::ShuttingDown), Next::Exit),
        }
    }

    fn load(
        &mut self,
        module: ModuleInfo,
        params: &Value,
    ) -> Result<ModuleInterface, (LoadErrorCode, String)> {
        if let Some(code) = params.get("fail") {
            let code: LoadErrorCode = serde_json::from_value(code.clone())
                .map_err(|e| (LoadErrorCode::Internal, format!("bad fail code: {e}")))?;
            return Err((code, format!("load of {} failed on request", module.name)));
        }
        if module.provider.trim().is_empty() {
            return Err((
                LoadErrorCode::NotFound,
                format!("module {} has no provider", module.name),
            ));
        }
        if self.modules.contains_key(&module.name) {
            return Err((
                LoadErrorCode::AlreadyLoaded,
                format!("module {} is already loaded", module.name),
            ));
        }

        self.loads += 1;
        let mut interface = ModuleInterface::new(format!("{}-{}", module.name, self.loads));
        interface.metadata = json!({
            "provider": module.provider,
            "version": module.version,
            "client": self.client,
        });
        info!(module = %module.name, token = %interface.token, "Module loaded");
        self.modules.insert(module.name, interface.clone());
        Ok(interface)
    }
}

async fn write_frame(stdout: &mut BufWriter<Stdout>, frame: &ResponseFrame) -> Result<()> {
    let line = serde_json::to_string(frame).context("Failed to encode response")?;
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SBX_WORKER_LOG")
                .unwrap_or_else(|_| EnvFilter::new("sbx_worker=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    debug!(
        uid = ?std::env::var("SBX_CLIENT_UID").ok(),
        package = ?std::env::var("SBX_CLIENT_PACKAGE").ok(),
        "Worker starting"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = BufWriter::new(tokio::io::stdout());
    let mut worker = Worker::default();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let frame: RequestFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed request");
                continue;
            }
        };

        let request_id = frame.request_id;
        debug!(request_id, request = frame.request.name(), "Request received");

        let (response, next) = worker.handle(frame.request);
        if let Some(response) = response {
            write_frame(
                &mut stdout,
                &ResponseFrame {
                    request_id,
                    response,
                },
            )
            .await?;
        }

        match next {
            Next::Continue => {}
            Next::Exit => {
                info!("Worker shutting down");
                return Ok(());
            }
            Next::Crash => std::process::exit(CRASH_EXIT_CODE),
        }
    }

    info!("Manager closed stdin, exiting");
    Ok(())
}
