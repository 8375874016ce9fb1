//! sbx core - shared types for the sandbox lifecycle manager
//!
//! This crate provides the domain types shared between the daemon
//! (sbxd), its worker processes, and control clients.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod identity;
pub mod latency;
pub mod module;
pub mod state;
pub mod view;

// Re-exports for convenience
pub use error::{DomainError, DomainResult, SandboxError};
pub use identity::{ClientIdentity, ModuleName};
pub use latency::{CallKind, Hop, LatencySample, Stage};
pub use module::{LoadErrorCode, LoadedModule, ModuleInfo, ModuleInterface};
pub use state::{LoadState, RestartPolicy, SandboxStatus};
pub use view::{SandboxView, SessionView};
