//! Per-call latency tracking.
//!
//! A [`LatencyTracker`] travels with one logical call. Each hop the call
//! passes through is stamped once; when the call ends the tracker turns the
//! stamps into one [`LatencySample`] per pipeline stage:
//!
//! ```text
//! AppCalled ─▶ FrontendReceived ─▶ [BindStarted ─▶ BindCompleted]
//!     ─▶ FrontendDispatched ─▶ WorkerReceived ─▶ WorkerCompleted
//!     ─▶ FrontendResumed ─▶ FrontendReplied
//! ```
//!
//! The bind detour only appears when the call had to wait for a worker.
//! Worker stages only appear when the call reached the transport. A stage
//! with a missing stamp is reported with zero duration and `unknown` set.
//! A failed call stops at the stage where the failure was detected, which
//! is reported with `success = false`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

use sbx_core::{CallKind, Hop, LatencySample, Stage};
use sbx_protocol::WorkerTimings;

/// Source of timestamps, in microseconds since the Unix epoch.
///
/// Wall-clock based so stamps taken by clients and workers in other
/// processes are comparable.
pub trait Clock: Send + Sync + 'static {
    fn now_micros(&self) -> u64;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_micros: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_micros)),
        }
    }

    pub fn advance(&self, micros: u64) {
        self.now.fetch_add(micros, Ordering::SeqCst);
    }

    pub fn set(&self, micros: u64) {
        self.now.store(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// How a tracked call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    FailedAt(Stage),
}

/// Hop stamps for one logical call.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    kind: CallKind,
    marks: BTreeMap<Hop, u64>,
}

impl LatencyTracker {
    /// Starts tracking a call the manager received at `received_at`.
    pub fn start(kind: CallKind, received_at: u64, app_called_at: Option<u64>) -> Self {
        let mut marks = BTreeMap::new();
        marks.insert(Hop::FrontendReceived, received_at);
        if let Some(at) = app_called_at {
            marks.insert(Hop::AppCalled, at);
        }
        Self { kind, marks }
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Stamps `hop`, replacing any earlier stamp.
    pub fn mark(&mut self, hop: Hop, at: u64) {
        self.marks.insert(hop, at);
    }

    pub fn has(&self, hop: Hop) -> bool {
        self.marks.contains_key(&hop)
    }

    /// Records the worker-side stamps it reported, if any.
    pub fn mark_worker(&mut self, timings: WorkerTimings) {
        if let Some(at) = timings.received_at {
            self.marks.insert(Hop::WorkerReceived, at);
        }
        if let Some(at) = timings.completed_at {
            self.marks.insert(Hop::WorkerCompleted, at);
        }
    }

    /// The stage a call is in right now, judged by the stamps it has.
    pub fn in_flight_stage(&self) -> Stage {
        if self.has(Hop::FrontendDispatched) {
            if self.has(Hop::WorkerCompleted) {
                Stage::WorkerToFrontend
            } else if self.has(Hop::WorkerReceived) {
                Stage::WorkerInternal
            } else {
                Stage::FrontendToWorkerDispatch
            }
        } else if self.has(Hop::BindStarted) && !self.has(Hop::BindCompleted) {
            Stage::FrontendToWorkerBind
        } else {
            Stage::FrontendToApp
        }
    }

    /// Ends the call and produces its samples.
    ///
    /// `replied_at` stamps `FrontendReplied` unless the call already did.
    pub fn finish(mut self, replied_at: u64, outcome: CallOutcome) -> Vec<LatencySample> {
        self.marks.entry(Hop::FrontendReplied).or_insert(replied_at);

        let failed_at = match outcome {
            CallOutcome::Success => None,
            CallOutcome::FailedAt(stage) => Some(stage),
        };
        let bound = self.has(Hop::BindStarted) || failed_at == Some(Stage::FrontendToWorkerBind);
        let dispatched = self.has(Hop::FrontendDispatched)
            || failed_at.is_some_and(|s| s.crosses_worker() && s != Stage::FrontendToWorkerBind);

        let mut samples = Vec::new();
        for stage in Stage::PIPELINE {
            let applies = match stage {
                Stage::FrontendToWorkerBind => bound,
                Stage::FrontendToWorkerDispatch | Stage::WorkerInternal | Stage::WorkerToFrontend => {
                    dispatched
                }
                Stage::AppToFrontend | Stage::FrontendToApp => true,
            };
            if !applies {
                continue;
            }

            let failed_here = failed_at == Some(stage);
            samples.push(self.measure(stage, failed_here));
            if failed_here {
                break;
            }
        }
        samples
    }

    fn measure(&self, stage: Stage, failed_here: bool) -> LatencySample {
        let (start_hop, end_hop) = stage.bounds();
        let replied = self.marks.get(&Hop::FrontendReplied).copied();

        let start = if stage == Stage::FrontendToApp {
            self.reply_start()
        } else {
            self.marks.get(&start_hop).copied()
        };
        let end = self
            .marks
            .get(&end_hop)
            .copied()
            .or(if failed_here { replied } else { None });

        let (duration_micros, unknown) = match (start, end) {
            (Some(start), Some(end)) => (end.saturating_sub(start), false),
            _ => (0, true),
        };

        LatencySample {
            kind: self.kind,
            stage,
            duration_micros,
            success: !failed_here,
            unknown,
        }
    }

    /// Calls answered without waiting for the worker reply from the moment
    /// they were received.
    fn reply_start(&self) -> Option<u64> {
        let replied = self.marks.get(&Hop::FrontendReplied).copied();
        match (self.marks.get(&Hop::FrontendResumed).copied(), replied) {
            (Some(resumed), Some(replied)) if resumed <= replied => Some(resumed),
            _ => self.marks.get(&Hop::FrontendReceived).copied(),
        }
    }
}
