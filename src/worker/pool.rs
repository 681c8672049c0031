//! Parent-side request pool.
//!
//! Holds the caller ends of the N request channels and the slot pool that
//! hands them out. A call takes a slot, does one round-trip on that slot's
//! channel, and gives the slot back, whatever the outcome.

use super::channel::CallerEnd;
use super::liveness::Liveness;
use super::protocol::{RequestEnvelope, ResponseEnvelope};
use super::slots::SlotPool;
use crate::error::RemoteError;
use std::time::{Duration, Instant};
use tracing::trace;

/// The N parent-side request channels plus their admission control.
#[derive(Debug)]
pub struct RequestPool {
    slots: SlotPool,
    channels: Vec<CallerEnd>,
    poll_interval: Duration,
}

impl RequestPool {
    pub fn new(channels: Vec<CallerEnd>, poll_interval: Duration) -> Self {
        Self {
            slots: SlotPool::new(channels.len()),
            channels,
            poll_interval,
        }
    }

    /// Run one request on the first free worker loop.
    pub fn call(
        &self,
        request: &RequestEnvelope,
        liveness: &dyn Liveness,
    ) -> Result<ResponseEnvelope, RemoteError> {
        let request_start = Instant::now();
        let slot = self.slots.acquire(liveness, self.poll_interval)?;
        let wait_time = request_start.elapsed();

        let response = self.channels[slot.index()].round_trip(request, liveness, self.poll_interval);

        trace!(
            slot = slot.index(),
            operation = %request.operation,
            slot_wait_ms = wait_time.as_millis(),
            total_ipc_time_ms = request_start.elapsed().as_millis(),
            "Worker IPC request/response"
        );
        response
    }

    /// Number of worker loops.
    #[cfg(test)]
    pub fn worker_count(&self) -> usize {
        self.channels.len()
    }

    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }
}
