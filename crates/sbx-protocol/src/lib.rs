//! sbx protocol - wire formats for the sandbox manager
//!
//! Two channels share this crate:
//! - `worker` - JSON-lines frames between the daemon and a sandbox worker
//! - `message` - JSON-lines control messages between clients and the daemon

pub mod message;
pub mod version;
pub mod worker;

pub use message::{ClientMessage, DaemonMessage, MessageType};
pub use version::{ProtocolVersion, VersionError};
pub use worker::{RequestFrame, ResponseFrame, WorkerRequest, WorkerResponse, WorkerTimings};
