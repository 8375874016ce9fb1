//! Telemetry sinks for latency samples and worker deaths.
//!
//! Sinks are fire-and-forget: the manager calls them from its actors and
//! never looks at a result, so implementations must not block.

use tracing::{debug, info};

use sbx_core::{ClientIdentity, LatencySample};

/// Receives manager measurements.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_latency(&self, identity: &ClientIdentity, sample: &LatencySample);

    /// A worker died; `callbacks` death callbacks were invoked.
    fn record_death(&self, identity: &ClientIdentity, death_generation: u64, callbacks: usize);
}

/// Writes measurements as `tracing` events under the `sbx::telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record_latency(&self, identity: &ClientIdentity, sample: &LatencySample) {
        debug!(
            target: "sbx::telemetry",
            identity = %identity,
            call = %sample.kind,
            stage = %sample.stage,
            duration_micros = sample.duration_micros,
            success = sample.success,
            unknown = sample.unknown,
            "latency"
        );
    }

    fn record_death(&self, identity: &ClientIdentity, death_generation: u64, callbacks: usize) {
        info!(
            target: "sbx::telemetry",
            identity = %identity,
            death_generation,
            callbacks,
            "worker death"
        );
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record_latency(&self, _identity: &ClientIdentity, _sample: &LatencySample) {}

    fn record_death(&self, _identity: &ClientIdentity, _death_generation: u64, _callbacks: usize) {}
}
