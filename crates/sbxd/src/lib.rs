//! sbx daemon - per-client sandbox supervisor and control server
//!
//! This crate provides the core infrastructure of the sandbox daemon:
//! - `manager` - One actor per client owning its worker and module sessions
//! - `sandbox` - Worker binding and load session state machines
//! - `transport` - How workers are bound and talked to
//! - `server` - Unix socket server for control clients
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        sbxd daemon                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  DaemonServer   │────▶│     ManagerHandle           │    │
//! │  │ (Unix Socket)   │     │  policy, catalog, routing   │    │
//! │  └────────┬────────┘     └──────────────┬──────────────┘    │
//! │           │                             │ per client        │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ConnectionHandler│     │   SandboxActor              │    │
//! │  │  (per client)   │     │   connection + sessions     │    │
//! │  └─────────────────┘     └──────────────┬──────────────┘    │
//! │                                         │                   │
//! │                          ┌──────────────▼──────────────┐    │
//! │                          │  WorkerTransport            │    │
//! │                          │  (sbx-worker processes)     │    │
//! │                          └─────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod catalog;
pub mod config;
pub mod death;
pub mod latency;
pub mod manager;
pub mod policy;
pub mod sandbox;
pub mod server;
pub mod sync;
pub mod telemetry;
pub mod transport;
