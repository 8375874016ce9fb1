//! Per-client sandbox state: the worker binding and the module sessions.
//!
//! Both types are plain state machines owned by a client's actor in
//! [`crate::manager`]. They never block and never touch the transport.

mod connection;
mod session;

pub use connection::{BindWaiter, ConnectStep, SandboxConnection, Teardown};
pub use session::{InterfaceReply, LoadReply, LoadSession};
