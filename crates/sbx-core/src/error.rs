//! Error types following the panic-free policy.
//!
//! `SandboxError` is the caller-facing taxonomy of the manager. Every
//! variant is `Clone` so a single failure can be fanned out to all waiters
//! of a pending bind or load.

use thiserror::Error;

use crate::identity::{ClientIdentity, ModuleName};
use crate::module::LoadErrorCode;

/// Errors reported to callers of the sandbox manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// A session for this (identity, module) pair is already pending or loaded.
    #[error("module {module} is already {} for {identity}", progress_word(.pending))]
    AlreadyLoaded {
        identity: ClientIdentity,
        module: ModuleName,
        /// True when the existing session is still waiting for the worker
        pending: bool,
    },

    /// The operation is not legal in the current state.
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    /// The module is not loaded, so it cannot serve the request.
    #[error("module {module} is not loaded")]
    NotLoaded { module: ModuleName },

    /// The worker is gone, could not be bound, or may not be restarted.
    #[error("sandbox worker unavailable: {reason}")]
    WorkerUnavailable { reason: String },

    /// The policy checker refused the request.
    #[error("request denied by policy: {reason}")]
    PolicyDenied { reason: String },

    /// The catalog does not know the requested module.
    #[error("module not found: {module}")]
    ModuleNotFound { module: ModuleName },

    /// The worker reported that it could not load the module.
    #[error("module load failed ({code}): {message}")]
    LoadFailed { code: LoadErrorCode, message: String },

    /// A loaded module could not serve an interface request.
    #[error("module {module} rejected the request: {message}")]
    RequestFailed { module: ModuleName, message: String },

    /// The manager has shut down before answering.
    #[error("response channel closed")]
    ChannelClosed,
}

impl SandboxError {
    /// Creates an invalid-state error.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Creates a worker-unavailable error.
    pub fn worker_unavailable(reason: impl Into<String>) -> Self {
        Self::WorkerUnavailable {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyLoaded { .. } => "already_loaded",
            Self::InvalidState { .. } => "invalid_state",
            Self::NotLoaded { .. } => "not_loaded",
            Self::WorkerUnavailable { .. } => "worker_unavailable",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::ModuleNotFound { .. } => "module_not_found",
            Self::LoadFailed { .. } => "load_failed",
            Self::RequestFailed { .. } => "request_failed",
            Self::ChannelClosed => "channel_closed",
        }
    }
}

fn progress_word(pending: &bool) -> &'static str {
    if *pending {
        "loading"
    } else {
        "loaded"
    }
}

/// Errors that can occur while building or parsing domain values.
#[derive(Error, Debug, Clone)]
pub enum DomainError {
    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_loaded_display() {
        let err = SandboxError::AlreadyLoaded {
            identity: ClientIdentity::new(10042, "com.example.app"),
            module: ModuleName::new("ads"),
            pending: true,
        };
        assert_eq!(
            err.to_string(),
            "module ads is already loading for 10042:com.example.app"
        );

        let err = SandboxError::AlreadyLoaded {
            identity: ClientIdentity::new(10042, "com.example.app"),
            module: ModuleName::new("ads"),
            pending: false,
        };
        assert!(err.to_string().contains("already loaded"));
    }

    #[test]
    fn test_error_codes_are_distinct() {
        let errors = [
            SandboxError::invalid_state("x"),
            SandboxError::NotLoaded {
                module: ModuleName::new("m"),
            },
            SandboxError::worker_unavailable("gone"),
            SandboxError::PolicyDenied {
                reason: "no".to_string(),
            },
            SandboxError::ModuleNotFound {
                module: ModuleName::new("m"),
            },
            SandboxError::LoadFailed {
                code: LoadErrorCode::Internal,
                message: "boom".to_string(),
            },
            SandboxError::RequestFailed {
                module: ModuleName::new("m"),
                message: "bad params".to_string(),
            },
            SandboxError::ChannelClosed,
        ];

        let mut codes: Vec<_> = errors.iter().map(SandboxError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_load_failed_display() {
        let err = SandboxError::LoadFailed {
            code: LoadErrorCode::ModuleDefined(7),
            message: "quota".to_string(),
        };
        assert_eq!(err.to_string(), "module load failed (module_defined:7): quota");
    }
}
