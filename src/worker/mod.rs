//! Worker process with a remote-call surface.
//!
//! A [`Service`] declares its operations once, is wrapped in a [`Worker`] and
//! started. The worker is a fork of the current process running the service's
//! main routine; the parent keeps a handle through which it calls
//! operations, reads properties and watches liveness.
//!
//! # Architecture
//!
//! ```text
//!          ┌──────────────────────────── Parent ─────────────────────────────┐
//!          │  callers ──► RequestPool (N slots)      ReaderChannel (lock)    │
//!          │                 │   │   │                     │                 │
//!          │           snapshot-collector ◄─┐              │                 │
//!          └─────────────────┼───┼───┼──────┼──────────────┼─────────────────┘
//!                  pipes     │   │   │      │ handoff      │
//!          ┌─────────────────▼───▼───▼──────┼──────────────▼─────────────────┐
//!          │  request-0 .. request-N-1      │            reader               │
//!          │        └──────── Dispatcher ───┼───────────────┘                 │
//!          │  timer.<name> ...          main routine ──► PropertyRegistry    │
//!          └──────────────────────────── Worker ─────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Bounded concurrency**: at most N calls in flight, one per request loop
//! - **Reader side-channel**: property reads bypass a busy request pool
//! - **Post-mortem properties**: values captured at exit stay readable
//! - **Periodic tasks**: self-adjusting maintenance loops inside the worker
//! - **Liveness**: a dead worker surfaces as status 502, never as a hang

mod channel;
mod dispatch;
mod ipc;
mod liveness;
mod pool;
mod proc;
mod process;
pub mod protocol;
mod reader;
pub mod registry;
mod signals;
mod slots;
pub mod snapshot;
mod spawn;
mod timer;
mod worker_main;

pub use dispatch::{ActiveCall, Interfaces};
pub use process::{Keepalive, Service, Worker};
pub use protocol::{RequestEnvelope, ResponseEnvelope, Status};
pub use registry::{Args, Capability, OpError, Registry};
pub use signals::TerminationReason;
pub use snapshot::{ErrorRecord, PropertyRegistry};
