//! Sandbox manager using one actor per client.
//!
//! The manager owns every client's worker binding and module sessions. Each
//! client gets its own actor, so state changes for one client are
//! serialized while different clients proceed in parallel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  IdentityCommand   ┌─────────────────┐
//! │  ManagerHandle  │───(mpsc, per id)──▶│  SandboxActor   │──┐
//! │ policy, catalog │                    │ connection +    │  │ spawned
//! └─────────────────┘                    │ sessions        │  │ transport
//!          │                             └─────────────────┘  │ calls
//!          │ death callbacks                     ▲            │
//!          ▼                                     └─completion─┘
//! ┌─────────────────┐                    ┌─────────────────┐
//! │  DeathNotifier  │◀──── on death ─────│ WorkerTransport │
//! └─────────────────┘                    └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

mod actor;
mod commands;
mod handle;

pub use commands::PendingLoad;
pub use handle::ManagerHandle;

use actor::{ActorSettings, Services};
use handle::Shared;

use crate::catalog::{ModuleCatalog, StaticCatalog};
use crate::config::ManagerConfig;
use crate::death::{DeathNotifier, LoggingOrphanHandler, OrphanHandler};
use crate::latency::{Clock, SystemClock};
use crate::policy::{PackageDenyList, PolicyChecker};
use crate::telemetry::{TelemetrySink, TracingSink};
use crate::transport::WorkerTransport;

/// Assembles a manager from its configuration and collaborators.
///
/// Policy and catalog default to the ones described by the configuration;
/// telemetry defaults to [`TracingSink`], time to [`SystemClock`] and the
/// orphan handler to [`LoggingOrphanHandler`].
pub struct ManagerBuilder {
    config: ManagerConfig,
    transport: Arc<dyn WorkerTransport>,
    policy: Option<Arc<dyn PolicyChecker>>,
    catalog: Option<Arc<dyn ModuleCatalog>>,
    telemetry: Arc<dyn TelemetrySink>,
    clock: Arc<dyn Clock>,
    orphans: Arc<dyn OrphanHandler>,
}

impl ManagerBuilder {
    pub fn new(config: ManagerConfig, transport: Arc<dyn WorkerTransport>) -> Self {
        Self {
            config,
            transport,
            policy: None,
            catalog: None,
            telemetry: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
            orphans: Arc::new(LoggingOrphanHandler),
        }
    }

    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn PolicyChecker>) -> Self {
        self.policy = Some(policy);
        self
    }

    #[must_use]
    pub fn catalog(mut self, catalog: Arc<dyn ModuleCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets what happens to clients orphaned by a worker death.
    #[must_use]
    pub fn orphan_handler(mut self, orphans: Arc<dyn OrphanHandler>) -> Self {
        self.orphans = orphans;
        self
    }

    /// Builds the manager.
    ///
    /// Actors are spawned on the first call for each client, so the
    /// returned handle must be used inside a tokio runtime.
    pub fn spawn(self) -> ManagerHandle {
        let policy: Arc<dyn PolicyChecker> = match self.policy {
            Some(policy) => policy,
            None => Arc::new(PackageDenyList::from_config(&self.config.policy)),
        };
        let catalog: Arc<dyn ModuleCatalog> = match self.catalog {
            Some(catalog) => catalog,
            None => Arc::new(StaticCatalog::new(self.config.modules.iter().cloned())),
        };

        let shared = Shared {
            services: Arc::new(Services {
                transport: self.transport,
                notifier: Arc::new(DeathNotifier::new()),
                orphans: self.orphans,
                telemetry: self.telemetry,
                clock: self.clock,
            }),
            policy,
            catalog,
            settings: ActorSettings {
                restart_policy: self.config.restart_policy,
                unbind_when_idle: self.config.unbind_when_idle,
                command_buffer: self.config.command_buffer.max(1),
            },
            actors: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        };

        ManagerHandle::new(Arc::new(shared))
    }
}

/// Builds a manager with the collaborators named by `config`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use sbxd::config::ManagerConfig;
/// use sbxd::manager::spawn_manager;
/// use sbxd::transport::ProcessTransport;
///
/// #[tokio::main]
/// async fn main() {
///     let config = ManagerConfig::default();
///     let transport = Arc::new(ProcessTransport::new(config.worker.clone()));
///     let manager = spawn_manager(config, transport);
///
///     let views = manager.dump().await;
/// }
/// ```
pub fn spawn_manager(config: ManagerConfig, transport: Arc<dyn WorkerTransport>) -> ManagerHandle {
    ManagerBuilder::new(config, transport).spawn()
}
