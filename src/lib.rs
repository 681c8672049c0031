//! iprocess - run an object in its own worker process and call into it.

pub mod config;
pub mod demo;
pub mod error;
pub mod logging;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{IprocError, RemoteError, Result};
pub use worker::{
    ActiveCall, Args, Capability, ErrorRecord, Interfaces, Keepalive, OpError, PropertyRegistry,
    Registry, Service, Status, TerminationReason, Worker,
};
