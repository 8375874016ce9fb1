//! Death-callback registry.
//!
//! Callbacks are registered per client and survive worker restarts until
//! they are removed or the client goes away. On each worker death every
//! callback registered for that client is invoked exactly once.
//!
//! # Panic-Free Guarantees
//!
//! - Callbacks run on a snapshot taken under the lock, never while holding it,
//!   so a callback may register or unregister callbacks itself
//! - A failing or panicking callback is logged and the fan-out continues
//! - Lock poisoning is recovered from rather than propagated

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

use sbx_core::{ClientIdentity, ModuleName};

/// Error a death callback may report.
#[derive(Debug, Clone, Error)]
#[error("death callback failed: {0}")]
pub struct CallbackError(pub String);

/// Something that wants to hear about a client's worker dying.
pub trait DeathCallback: Send + Sync + 'static {
    fn on_worker_death(&self, identity: &ClientIdentity) -> Result<(), CallbackError>;
}

/// Adapter that turns a closure into a [`DeathCallback`].
struct FnCallback<F>(F);

impl<F> DeathCallback for FnCallback<F>
where
    F: Fn(&ClientIdentity) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    fn on_worker_death(&self, identity: &ClientIdentity) -> Result<(), CallbackError> {
        (self.0)(identity)
    }
}

/// Wraps a closure as a shareable death callback.
pub fn death_callback_fn<F>(f: F) -> Arc<dyn DeathCallback>
where
    F: Fn(&ClientIdentity) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    Arc::new(FnCallback(f))
}

/// Callback identity is the allocation, not the vtable.
fn same_callback(a: &Arc<dyn DeathCallback>, b: &Arc<dyn DeathCallback>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub invoked: usize,
    pub failed: usize,
}

/// Per-client set of death callbacks.
#[derive(Default)]
pub struct DeathNotifier {
    callbacks: Mutex<HashMap<ClientIdentity, Vec<Arc<dyn DeathCallback>>>>,
}

impl DeathNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `callback` for `identity`. Returns false if it was already registered.
    pub fn register(&self, identity: &ClientIdentity, callback: Arc<dyn DeathCallback>) -> bool {
        let mut map = self.lock();
        let entry = map.entry(identity.clone()).or_default();
        if entry.iter().any(|cb| same_callback(cb, &callback)) {
            return false;
        }
        entry.push(callback);
        debug!(identity = %identity, count = entry.len(), "Death callback registered");
        true
    }

    /// Removes `callback` for `identity`. Returns false if it was not registered.
    pub fn unregister(&self, identity: &ClientIdentity, callback: &Arc<dyn DeathCallback>) -> bool {
        let mut map = self.lock();
        let Some(entry) = map.get_mut(identity) else {
            return false;
        };

        let before = entry.len();
        entry.retain(|cb| !same_callback(cb, callback));
        let removed = entry.len() != before;

        if entry.is_empty() {
            map.remove(identity);
        }
        removed
    }

    /// Drops every callback of `identity`, returning how many there were.
    pub fn remove_all(&self, identity: &ClientIdentity) -> usize {
        self.lock().remove(identity).map_or(0, |cbs| cbs.len())
    }

    pub fn count(&self, identity: &ClientIdentity) -> usize {
        self.lock().get(identity).map_or(0, Vec::len)
    }

    /// Invokes every callback registered for `identity`.
    pub fn notify(&self, identity: &ClientIdentity) -> NotifyReport {
        let snapshot: Vec<Arc<dyn DeathCallback>> =
            self.lock().get(identity).cloned().unwrap_or_default();

        let mut report = NotifyReport::default();
        for callback in snapshot {
            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| callback.on_worker_death(identity))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(identity = %identity, error = %e, "Death callback failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(identity = %identity, "Death callback panicked");
                }
            }
        }
        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ClientIdentity, Vec<Arc<dyn DeathCallback>>>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Orphaned Clients
// ============================================================================

/// Decides what happens to a client whose worker died while it had modules
/// loaded and nobody was watching for the death.
///
/// Such a client holds interfaces into a process that no longer exists and
/// has no way to find out. The daemon cannot kill the client itself; the
/// embedding supervisor can.
pub trait OrphanHandler: Send + Sync + 'static {
    fn on_orphaned(&self, identity: &ClientIdentity, loaded: &[ModuleName]);
}

/// Default handler: logs the orphaned client and leaves it alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingOrphanHandler;

impl OrphanHandler for LoggingOrphanHandler {
    fn on_orphaned(&self, identity: &ClientIdentity, loaded: &[ModuleName]) {
        warn!(
            identity = %identity,
            modules = loaded.len(),
            "Client lost its sandbox with modules loaded and no death callback"
        );
    }
}

struct FnOrphanHandler<F>(F);

impl<F> OrphanHandler for FnOrphanHandler<F>
where
    F: Fn(&ClientIdentity, &[ModuleName]) + Send + Sync + 'static,
{
    fn on_orphaned(&self, identity: &ClientIdentity, loaded: &[ModuleName]) {
        (self.0)(identity, loaded)
    }
}

/// Wraps a closure as an orphan handler.
pub fn orphan_handler_fn<F>(f: F) -> Arc<dyn OrphanHandler>
where
    F: Fn(&ClientIdentity, &[ModuleName]) + Send + Sync + 'static,
{
    Arc::new(FnOrphanHandler(f))
}

/// Runs `handler`, containing a panic the way callback fan-out does.
pub(crate) fn report_orphan(
    handler: &dyn OrphanHandler,
    identity: &ClientIdentity,
    loaded: &[ModuleName],
) {
    if catch_unwind(AssertUnwindSafe(|| handler.on_orphaned(identity, loaded))).is_err() {
        warn!(identity = %identity, "Orphan handler panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, Arc<dyn DeathCallback>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let cb = death_callback_fn(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (hits, cb)
    }

    #[test]
    fn test_register_is_idempotent() {
        let notifier = DeathNotifier::new();
        let id = ClientIdentity::new(1, "com.example");
        let (hits, cb) = counting();

        assert!(notifier.register(&id, Arc::clone(&cb)));
        assert!(!notifier.register(&id, Arc::clone(&cb)));
        assert_eq!(notifier.count(&id), 1);

        notifier.notify(&id);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let notifier = DeathNotifier::new();
        let id = ClientIdentity::new(1, "com.example");
        let (hits, cb) = counting();

        notifier.register(&id, Arc::clone(&cb));
        assert!(notifier.unregister(&id, &cb));
        assert!(!notifier.unregister(&id, &cb));

        let report = notifier.notify(&id);
        assert_eq!(report.invoked, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_callback_does_not_stop_fan_out() {
        let notifier = DeathNotifier::new();
        let id = ClientIdentity::new(1, "com.example");
        let (first_hits, first) = counting();
        let (last_hits, last) = counting();

        notifier.register(&id, first);
        notifier.register(
            &id,
            death_callback_fn(|_| Err(CallbackError("registrant is gone".to_string()))),
        );
        notifier.register(&id, last);

        let report = notifier.notify(&id);
        assert_eq!(report, NotifyReport { invoked: 3, failed: 1 });
        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(last_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_callback_counts_as_failure() {
        let notifier = DeathNotifier::new();
        let id = ClientIdentity::new(1, "com.example");
        let (hits, counting_cb) = counting();

        notifier.register(&id, death_callback_fn(|_| panic!("listener bug")));
        notifier.register(&id, counting_cb);

        let report = notifier.notify(&id);
        assert_eq!(report, NotifyReport { invoked: 2, failed: 1 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The registry is still usable afterwards.
        assert_eq!(notifier.count(&id), 2);
        assert_eq!(notifier.notify(&id).failed, 1);
    }

    #[test]
    fn test_panicking_orphan_handler_is_contained() {
        let id = ClientIdentity::new(1, "com.example");
        let handler = orphan_handler_fn(|_, _| panic!("supervisor bug"));

        report_orphan(handler.as_ref(), &id, &[ModuleName::from("ads")]);
    }

    #[test]
    fn test_callbacks_are_per_identity() {
        let notifier = DeathNotifier::new();
        let a = ClientIdentity::new(1, "com.a");
        let b = ClientIdentity::new(1, "com.b");
        let (hits, cb) = counting();

        notifier.register(&a, cb);
        notifier.notify(&b);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert_eq!(notifier.remove_all(&a), 1);
        assert_eq!(notifier.count(&a), 0);
    }

    #[test]
    fn test_callback_may_reenter_notifier() {
        let notifier = Arc::new(DeathNotifier::new());
        let id = ClientIdentity::new(1, "com.example");

        let inner = Arc::clone(&notifier);
        notifier.register(
            &id,
            death_callback_fn(move |identity| {
                // Would deadlock if notify held the lock while invoking.
                inner.remove_all(identity);
                Ok(())
            }),
        );

        assert_eq!(notifier.notify(&id).invoked, 1);
        assert_eq!(notifier.count(&id), 0);
    }
}
