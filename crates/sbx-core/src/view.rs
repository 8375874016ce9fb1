//! Read-only views of manager state for queries and diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{ClientIdentity, ModuleName};
use crate::state::{LoadState, SandboxStatus};

/// Snapshot of one module session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub module: ModuleName,
    pub state: LoadState,

    /// When the session was created
    pub requested_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,

    /// Error that ended the session, if it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Interface requests waiting on the worker
    pub pending_requests: usize,
}

/// Snapshot of one client's sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxView {
    pub identity: ClientIdentity,
    pub status: SandboxStatus,

    /// True when a death under the forbid policy blocks rebinding
    pub restart_blocked: bool,

    /// Number of worker deaths observed for this client
    pub death_generation: u64,

    /// Callers waiting on an in-flight bind
    pub pending_waiters: usize,

    /// Registered death callbacks
    pub death_callbacks: usize,

    pub sessions: Vec<SessionView>,
}

impl SandboxView {
    /// Returns the view of one module session, if present.
    pub fn session(&self, module: &ModuleName) -> Option<&SessionView> {
        self.sessions.iter().find(|s| &s.module == module)
    }

    /// Number of sessions currently loaded.
    pub fn loaded_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state == LoadState::Loaded)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_with(states: &[(&str, LoadState)]) -> SandboxView {
        SandboxView {
            identity: ClientIdentity::new(1000, "com.example"),
            status: SandboxStatus::Created,
            restart_blocked: false,
            death_generation: 0,
            pending_waiters: 0,
            death_callbacks: 0,
            sessions: states
                .iter()
                .map(|(name, state)| SessionView {
                    module: ModuleName::new(*name),
                    state: *state,
                    requested_at: Utc::now(),
                    loaded_at: None,
                    last_error: None,
                    pending_requests: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_loaded_count_ignores_other_states() {
        let view = view_with(&[
            ("a", LoadState::Loaded),
            ("b", LoadState::LoadPending),
            ("c", LoadState::Unloaded),
            ("d", LoadState::Loaded),
        ]);
        assert_eq!(view.loaded_count(), 2);
    }

    #[test]
    fn test_session_lookup() {
        let view = view_with(&[("a", LoadState::LoadFailed)]);
        assert_eq!(
            view.session(&ModuleName::new("a")).map(|s| s.state),
            Some(LoadState::LoadFailed)
        );
        assert!(view.session(&ModuleName::new("z")).is_none());
    }
}
