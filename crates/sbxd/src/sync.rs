//! Listeners for clients waiting on a sandbox to come up.
//!
//! A client that syncs data while it has no bound worker gets
//! `WorkerUnavailable` back, and may leave a listener behind. The listener is
//! told once, the next time a worker is bound for that client, so the client
//! can sync again. A client keeps at most one listener; a newer one replaces
//! the older.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use sbx_core::ClientIdentity;

/// Something waiting for a client's sandbox to start.
pub trait SandboxStartListener: Send + Sync + 'static {
    fn on_sandbox_start(&self, identity: &ClientIdentity);
}

impl fmt::Debug for dyn SandboxStartListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SandboxStartListener")
    }
}

struct FnListener<F>(F);

impl<F> SandboxStartListener for FnListener<F>
where
    F: Fn(&ClientIdentity) + Send + Sync + 'static,
{
    fn on_sandbox_start(&self, identity: &ClientIdentity) {
        (self.0)(identity)
    }
}

/// Wraps a closure as a sandbox start listener.
pub fn start_listener_fn<F>(f: F) -> Arc<dyn SandboxStartListener>
where
    F: Fn(&ClientIdentity) + Send + Sync + 'static,
{
    Arc::new(FnListener(f))
}

/// Tells `listener` the sandbox is up. A panicking listener is logged.
pub(crate) fn notify_start(listener: &dyn SandboxStartListener, identity: &ClientIdentity) {
    debug!(identity = %identity, "Notifying sandbox start listener");
    if catch_unwind(AssertUnwindSafe(|| listener.on_sandbox_start(identity))).is_err() {
        warn!(identity = %identity, "Sandbox start listener panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fn_listener_receives_identity() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let listener = start_listener_fn(move |identity| {
            assert_eq!(identity.package_name, "com.example");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        listener.on_sandbox_start(&ClientIdentity::new(1, "com.example"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
