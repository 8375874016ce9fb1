//! Binding state of one client's worker.
//!
//! ```text
//!              connect()               bind ok
//! NonExistent ───────────▶ CreatePending ───────▶ Created
//!      ▲                      │   │                  │
//!      │       bind failed    │   │ death            │ death / release
//!      └──────────────────────┴───┴──────────────────┘
//! ```
//!
//! Every transition into `CreatePending` opens a new generation. Bind
//! results carry the generation they were started under, so a result that
//! arrives after a death or a release is recognised as stale.
//!
//! This type is plain data owned by the client's actor; it never does I/O.
//! Callers resolve the waiters it hands back.

use tokio::sync::oneshot;

use sbx_core::{ClientIdentity, ModuleName, RestartPolicy, SandboxError, SandboxStatus};

use crate::transport::{WorkerHandle, WorkerId};

/// Someone waiting for the in-flight bind.
#[derive(Debug)]
pub enum BindWaiter {
    /// A direct `connect()` caller
    Caller(oneshot::Sender<Result<WorkerHandle, SandboxError>>),
    /// A load session waiting to dispatch
    Load { module: ModuleName, session: u64 },
}

/// What the actor has to do after a `connect`.
#[derive(Debug)]
pub enum ConnectStep {
    /// A worker is bound; resolve the waiter now
    Ready(WorkerHandle, BindWaiter),
    /// Joined the in-flight bind
    Queued,
    /// Start a bind under this generation; the waiter is queued
    Bind { generation: u64 },
    /// Rebinding is blocked; fail the waiter now
    Refused(SandboxError, BindWaiter),
}

/// State torn down by a death or a release.
#[derive(Debug, Default)]
pub struct Teardown {
    pub worker: Option<WorkerHandle>,
    pub waiters: Vec<BindWaiter>,
}

#[derive(Debug)]
enum Binding {
    Idle,
    Pending { generation: u64, waiters: Vec<BindWaiter> },
    Bound { worker: WorkerHandle },
}

/// Worker binding for one client.
#[derive(Debug)]
pub struct SandboxConnection {
    identity: ClientIdentity,
    policy: RestartPolicy,
    binding: Binding,
    generation: u64,
    death_generation: u64,
    restart_blocked: bool,
}

impl SandboxConnection {
    pub fn new(identity: ClientIdentity, policy: RestartPolicy) -> Self {
        Self {
            identity,
            policy,
            binding: Binding::Idle,
            generation: 0,
            death_generation: 0,
            restart_blocked: false,
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn status(&self) -> SandboxStatus {
        match self.binding {
            Binding::Idle => SandboxStatus::NonExistent,
            Binding::Pending { .. } => SandboxStatus::CreatePending,
            Binding::Bound { .. } => SandboxStatus::Created,
        }
    }

    pub fn worker(&self) -> Option<&WorkerHandle> {
        match &self.binding {
            Binding::Bound { worker } => Some(worker),
            _ => None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of deaths observed.
    pub fn death_generation(&self) -> u64 {
        self.death_generation
    }

    pub fn restart_blocked(&self) -> bool {
        self.restart_blocked
    }

    pub fn waiter_count(&self) -> usize {
        match &self.binding {
            Binding::Pending { waiters, .. } => waiters.len(),
            _ => 0,
        }
    }

    /// Asks for a worker on behalf of `waiter`.
    ///
    /// At most one bind is ever in flight: callers arriving while one is
    /// pending are queued behind it.
    pub fn connect(&mut self, waiter: BindWaiter) -> ConnectStep {
        match &mut self.binding {
            Binding::Bound { worker } => ConnectStep::Ready(worker.clone(), waiter),
            Binding::Pending { waiters, .. } => {
                waiters.push(waiter);
                ConnectStep::Queued
            }
            Binding::Idle if self.restart_blocked => ConnectStep::Refused(
                SandboxError::worker_unavailable(
                    "worker died and restart is forbidden until reset",
                ),
                waiter,
            ),
            Binding::Idle => {
                self.generation += 1;
                self.binding = Binding::Pending {
                    generation: self.generation,
                    waiters: vec![waiter],
                };
                ConnectStep::Bind {
                    generation: self.generation,
                }
            }
        }
    }

    /// Records a successful bind.
    ///
    /// Returns the bound worker and the waiters to resolve, or gives the
    /// worker back if the result is stale and must be released.
    pub fn bind_succeeded(
        &mut self,
        generation: u64,
        worker: WorkerHandle,
    ) -> Result<Vec<BindWaiter>, WorkerHandle> {
        match &mut self.binding {
            Binding::Pending {
                generation: current,
                waiters,
            } if *current == generation => {
                let waiters = std::mem::take(waiters);
                self.binding = Binding::Bound { worker };
                Ok(waiters)
            }
            _ => Err(worker),
        }
    }

    /// Records a failed bind. Returns `None` if the result is stale.
    pub fn bind_failed(&mut self, generation: u64) -> Option<Vec<BindWaiter>> {
        match &mut self.binding {
            Binding::Pending {
                generation: current,
                waiters,
            } if *current == generation => {
                let waiters = std::mem::take(waiters);
                self.binding = Binding::Idle;
                Some(waiters)
            }
            _ => None,
        }
    }

    /// Records a worker death.
    ///
    /// `worker` names the worker that died when the reporter knows it; a
    /// report about any other worker is stale. Returns `None` when there
    /// was no live worker to lose, in which case nothing changed.
    pub fn on_death(&mut self, worker: Option<WorkerId>) -> Option<Teardown> {
        let teardown = match (&mut self.binding, worker) {
            (Binding::Idle, _) => return None,
            (Binding::Bound { worker: bound }, Some(id)) if bound.id() != id => return None,
            // A named worker cannot be the one still being bound.
            (Binding::Pending { .. }, Some(_)) => return None,
            (Binding::Pending { waiters, .. }, None) => Teardown {
                worker: None,
                waiters: std::mem::take(waiters),
            },
            (Binding::Bound { worker: bound }, _) => Teardown {
                worker: Some(bound.clone()),
                waiters: Vec::new(),
            },
        };

        self.binding = Binding::Idle;
        self.generation += 1;
        self.death_generation += 1;
        if self.policy == RestartPolicy::Forbid {
            self.restart_blocked = true;
        }
        Some(teardown)
    }

    /// Drops the binding on purpose (stop, idle release, client exit).
    pub fn release(&mut self) -> Teardown {
        let teardown = match std::mem::replace(&mut self.binding, Binding::Idle) {
            Binding::Idle => return Teardown::default(),
            Binding::Pending { waiters, .. } => Teardown {
                worker: None,
                waiters,
            },
            Binding::Bound { worker } => Teardown {
                worker: Some(worker),
                waiters: Vec::new(),
            },
        };
        self.generation += 1;
        teardown
    }

    /// Clears a restart block. Returns true if one was set.
    pub fn reset(&mut self) -> bool {
        std::mem::replace(&mut self.restart_blocked, false)
    }
}
