//! Lifecycle states for sandboxes and module sessions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DomainError;

/// State of a single module load session.
///
/// ```text
/// LoadPending ──▶ Loaded ──▶ Unloaded
///      │
///      └────────▶ LoadFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    /// Waiting for the worker to report the load outcome
    LoadPending,
    /// The module is loaded and can serve interface requests
    Loaded,
    /// The load failed; a fresh session is needed to retry
    LoadFailed,
    /// The module was unloaded or its worker died
    Unloaded,
}

impl LoadState {
    /// Returns true for states no transition leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoadFailed | Self::Unloaded)
    }

    /// Returns true while the session blocks a new load of the same module.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns a short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Self::LoadPending => "load_pending",
            Self::Loaded => "loaded",
            Self::LoadFailed => "load_failed",
            Self::Unloaded => "unloaded",
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Binding state of a client's sandbox worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    /// No worker and no bind in flight
    #[default]
    NonExistent,
    /// One bind request is in flight
    CreatePending,
    /// A worker is bound and usable
    Created,
}

impl SandboxStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NonExistent => "non_existent",
            Self::CreatePending => "create_pending",
            Self::Created => "created",
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What happens to a sandbox after its worker dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// The next connect binds a fresh worker
    #[default]
    Allow,
    /// Connects fail until the sandbox is explicitly reset
    Forbid,
}

impl FromStr for RestartPolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "forbid" => Ok(Self::Forbid),
            other => Err(DomainError::InvalidFieldValue {
                field: "restart policy".to_string(),
                value: other.to_string(),
                expected: "allow or forbid".to_string(),
            }),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Forbid => write!(f, "forbid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_state_terminality() {
        assert!(LoadState::LoadPending.is_live());
        assert!(LoadState::Loaded.is_live());
        assert!(LoadState::LoadFailed.is_terminal());
        assert!(LoadState::Unloaded.is_terminal());
    }

    #[test]
    fn test_restart_policy_parse() {
        assert_eq!("allow".parse::<RestartPolicy>().unwrap(), RestartPolicy::Allow);
        assert_eq!(" FORBID ".parse::<RestartPolicy>().unwrap(), RestartPolicy::Forbid);
        assert!("sometimes".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&SandboxStatus::CreatePending).unwrap();
        assert_eq!(json, "\"create_pending\"");
        assert_eq!(SandboxStatus::default(), SandboxStatus::NonExistent);
    }
}
