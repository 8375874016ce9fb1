//! Integration tests for the process transport against the `sbx-worker` binary.
//!
//! Tests may use `.unwrap()` and `.expect()`; the panic-free behavior of
//! production code is checked through assertions.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use sbx_core::{ClientIdentity, LoadErrorCode, ModuleInfo, ModuleName};
use sbx_protocol::{WorkerRequest, WorkerResponse};
use sbxd::catalog::StaticCatalog;
use sbxd::config::{ManagerConfig, WorkerConfig};
use sbxd::manager::{ManagerBuilder, ManagerHandle};
use sbxd::telemetry::NullSink;
use sbxd::transport::{ProcessTransport, TransportError, WorkerHandle, WorkerTransport};

/// How long a crashed worker may take to be noticed
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Unload and reload cycles run against one worker
const RELOAD_ROUNDS: usize = 200;

fn transport() -> ProcessTransport {
    ProcessTransport::new(WorkerConfig {
        command: vec![env!("CARGO_BIN_EXE_sbx-worker").to_string()],
        ..WorkerConfig::default()
    })
}

fn identity() -> ClientIdentity {
    ClientIdentity::new(10_042, "com.example.app")
}

/// A manager driving real `sbx-worker` processes that stay bound while idle.
fn manager() -> ManagerHandle {
    let config = ManagerConfig {
        unbind_when_idle: false,
        ..ManagerConfig::default()
    };
    ManagerBuilder::new(config, Arc::new(transport()))
        .catalog(Arc::new(StaticCatalog::new([ModuleInfo::new(
            "ads",
            "com.example.ads",
        )])))
        .telemetry(Arc::new(NullSink))
        .spawn()
}

async fn load(
    transport: &ProcessTransport,
    worker: &WorkerHandle,
    module: ModuleInfo,
    params: Value,
) -> Result<WorkerResponse, TransportError> {
    transport
        .send(worker, WorkerRequest::LoadModule { module, params })
        .await
}

#[tokio::test]
async fn test_worker_serves_module_lifecycle() {
    let transport = transport();
    let worker = transport.bind(&identity()).await.expect("bind worker");
    assert_eq!(transport.worker_count(), 1);
    assert!(!worker.is_closed());

    let response = load(
        &transport,
        &worker,
        ModuleInfo::new("ads", "com.example.ads"),
        json!({}),
    )
    .await
    .unwrap();
    match response {
        WorkerResponse::Loaded { interface, timings } => {
            assert_eq!(interface.token, "ads-1");
            assert_eq!(interface.metadata["client"], "10042:com.example.app");
            assert!(timings.received_at.is_some());
            assert!(timings.completed_at >= timings.received_at);
        }
        other => panic!("Expected Loaded, got {other:?}"),
    }

    let response = transport
        .send(
            &worker,
            WorkerRequest::RequestInterface {
                module: ModuleName::new("ads"),
                params: json!({"slot": "banner"}),
            },
        )
        .await
        .unwrap();
    match response {
        WorkerResponse::Interface { payload, .. } => {
            assert_eq!(payload["echo"]["slot"], "banner");
        }
        other => panic!("Expected Interface, got {other:?}"),
    }

    let response = transport
        .send(
            &worker,
            WorkerRequest::UnloadModule {
                module: ModuleName::new("ads"),
            },
        )
        .await
        .unwrap();
    assert!(matches!(response, WorkerResponse::Unloaded { .. }));

    let response = transport
        .send(
            &worker,
            WorkerRequest::RequestInterface {
                module: ModuleName::new("ads"),
                params: Value::Null,
            },
        )
        .await
        .unwrap();
    assert!(matches!(response, WorkerResponse::RequestFailed { .. }));

    transport.unbind(&worker).await;
    assert!(worker.is_closed());
    assert_eq!(transport.worker_count(), 0);
}

#[tokio::test]
async fn test_worker_reports_load_failures() {
    let transport = transport();
    let worker = transport.bind(&identity()).await.unwrap();

    let response = load(&transport, &worker, ModuleInfo::new("ads", ""), json!({}))
        .await
        .unwrap();
    assert!(matches!(
        response,
        WorkerResponse::LoadFailed {
            code: LoadErrorCode::NotFound,
            ..
        }
    ));

    let response = load(
        &transport,
        &worker,
        ModuleInfo::new("maps", "com.example.maps"),
        json!({"fail": "instantiation"}),
    )
    .await
    .unwrap();
    assert!(matches!(
        response,
        WorkerResponse::LoadFailed {
            code: LoadErrorCode::Instantiation,
            ..
        }
    ));

    transport.unbind(&worker).await;
}

#[tokio::test]
async fn test_crashed_worker_closes_handle() {
    let transport = transport();
    let worker = transport.bind(&identity()).await.unwrap();

    let result = load(
        &transport,
        &worker,
        ModuleInfo::new("ads", "com.example.ads"),
        json!({"crash": true}),
    )
    .await;
    assert_eq!(result.unwrap_err(), TransportError::Disconnected);

    timeout(CLOSE_TIMEOUT, worker.closed())
        .await
        .expect("handle closes after crash");

    let result = transport
        .send(
            &worker,
            WorkerRequest::UnloadModule {
                module: ModuleName::new("ads"),
            },
        )
        .await;
    assert_eq!(result.unwrap_err(), TransportError::Disconnected);

    transport.unbind(&worker).await;
    assert_eq!(transport.worker_count(), 0);
}

#[tokio::test]
async fn test_each_bind_is_a_separate_worker() {
    let transport = transport();
    let a = transport.bind(&identity()).await.unwrap();
    let b = transport
        .bind(&ClientIdentity::new(10_043, "com.example.other"))
        .await
        .unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(transport.worker_count(), 2);

    transport.unbind(&a).await;
    assert!(a.is_closed());
    assert!(!b.is_closed());

    transport.unbind(&b).await;
    assert_eq!(transport.worker_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unload_then_reload_reaches_worker_in_order() {
    let manager = manager();
    let id = identity();
    let ads = ModuleName::new("ads");

    manager
        .load_module(&id, &ads, json!({}), None)
        .await
        .expect("initial load");

    for round in 0..RELOAD_ROUNDS {
        manager
            .request_unload(&id, &ads, None)
            .await
            .unwrap_or_else(|e| panic!("unload in round {round}: {e}"));
        manager
            .load_module(&id, &ads, json!({}), None)
            .await
            .unwrap_or_else(|e| panic!("reload in round {round}: {e}"));
    }

    let view = manager.sandbox_status(&id).await.unwrap();
    assert_eq!(view.death_generation, 0);
    assert_eq!(view.loaded_count(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_synced_data_is_visible_to_modules() {
    let manager = manager();
    let id = identity();
    let ads = ModuleName::new("ads");

    manager.load_module(&id, &ads, json!({}), None).await.unwrap();
    manager
        .sync_data(&id, json!({"consent": true, "region": "eu"}), None, None)
        .await
        .expect("sync reaches the worker");
    manager
        .sync_data(&id, json!({"region": null}), None, None)
        .await
        .unwrap();

    let payload = manager
        .request_interface(&id, &ads, json!({}), None)
        .await
        .unwrap();
    assert_eq!(payload["data"], json!({"consent": true}));
    manager.shutdown().await;
}
