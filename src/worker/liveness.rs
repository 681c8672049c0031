//! Liveness-polling waits.
//!
//! Every blocking point on the parent side (slot acquisition, response
//! receipt) waits in bounded steps and re-checks whether the worker is still
//! alive between steps, so a dead worker surfaces as status 502 instead of a
//! hang.

use crate::error::RemoteError;
use std::time::Duration;

/// Anything that can report whether the worker is still running.
pub trait Liveness: Send + Sync {
    fn is_alive(&self) -> bool;

    /// Exit code once the worker has terminated.
    fn exit_code(&self) -> Option<i32>;
}

/// Result of one bounded wait step.
#[derive(Debug)]
pub enum Polled<T> {
    Ready(T),
    /// Nothing arrived within the step; check liveness and try again.
    Pending,
    /// The other side is gone for good.
    Closed,
}

/// Repeatedly run `attempt` with `interval` as its time bound until it yields
/// a value, failing with `Unreachable` once the worker is found dead or the
/// source is closed.
pub fn wait_alive<T, F>(liveness: &dyn Liveness, interval: Duration, mut attempt: F) -> Result<T, RemoteError>
where
    F: FnMut(Duration) -> Polled<T>,
{
    loop {
        match attempt(interval) {
            Polled::Ready(value) => return Ok(value),
            Polled::Closed => return Err(RemoteError::unreachable(liveness.exit_code())),
            Polled::Pending => {
                if !liveness.is_alive() {
                    return Err(RemoteError::unreachable(liveness.exit_code()));
                }
            }
        }
    }
}
