//! Slot pool: admission control for the worker loops.
//!
//! The pool holds the indices `0..N` of the request channels. A caller takes
//! an index for the duration of one round-trip and gives it back when done,
//! so at most N calls are in flight and each loop sees one call at a time.

use super::liveness::{Liveness, Polled, wait_alive};
use crate::error::RemoteError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::time::Duration;
use tracing::trace;

/// Bounded FIFO of worker-loop indices.
#[derive(Debug)]
pub struct SlotPool {
    release: Sender<usize>,
    acquire: Receiver<usize>,
    capacity: usize,
}

impl SlotPool {
    /// Create a pool holding every index in `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        let (release, acquire) = bounded(capacity);
        for index in 0..capacity {
            // Cannot fail: the channel has room for exactly `capacity` items
            // and the receiver is alive.
            let _ = release.send(index);
        }
        Self {
            release,
            acquire,
            capacity,
        }
    }

    /// Take a slot, waiting as long as the worker stays alive.
    pub fn acquire(
        &self,
        liveness: &dyn Liveness,
        poll_interval: Duration,
    ) -> Result<SlotGuard<'_>, RemoteError> {
        let index = wait_alive(liveness, poll_interval, |timeout| {
            match self.acquire.recv_timeout(timeout) {
                Ok(index) => Polled::Ready(index),
                Err(RecvTimeoutError::Timeout) => Polled::Pending,
                Err(RecvTimeoutError::Disconnected) => Polled::Closed,
            }
        })?;
        trace!(slot = index, "Slot acquired");
        Ok(SlotGuard { pool: self, index })
    }

    /// Take a slot only if one is free right now.
    #[cfg(test)]
    pub fn try_acquire(&self) -> Option<SlotGuard<'_>> {
        self.acquire
            .try_recv()
            .ok()
            .map(|index| SlotGuard { pool: self, index })
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.acquire.len()
    }

    /// Number of slots bound to in-flight calls.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Exclusive use of one slot; returns it to the pool on drop.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    pool: &'a SlotPool,
    index: usize,
}

impl SlotGuard<'_> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        trace!(slot = self.index, "Slot released");
        // The pool owns the receiver, so it outlives every guard and the
        // channel always has room for the index being returned.
        let _ = self.pool.release.send(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::liveness::testing::FakeLiveness;
    use crate::worker::protocol::Status;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    const POLL: Duration = Duration::from_millis(10);

    #[test]
    fn test_slots_are_distinct() {
        let pool = SlotPool::new(3);
        let liveness = FakeLiveness::alive();
        let guards: Vec<_> = (0..3).map(|_| pool.acquire(&liveness, POLL).unwrap()).collect();
        let indices: HashSet<_> = guards.iter().map(SlotGuard::index).collect();
        assert_eq!(indices, HashSet::from([0, 1, 2]));
        assert!(pool.try_acquire().is_none());
    }

    #[test]
    fn test_slot_accounting_invariant() {
        let pool = SlotPool::new(4);
        let liveness = FakeLiveness::alive();
        assert_eq!(pool.available() + pool.in_flight(), pool.capacity());

        let a = pool.acquire(&liveness, POLL).unwrap();
        let b = pool.acquire(&liveness, POLL).unwrap();
        assert_eq!(pool.in_flight(), 2);
        assert_eq!(pool.available() + pool.in_flight(), 4);

        drop(a);
        assert_eq!(pool.in_flight(), 1);
        drop(b);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_extra_caller_blocks_until_release() {
        let pool = SlotPool::new(1);
        let liveness = FakeLiveness::alive();
        let held = pool.acquire(&liveness, POLL).unwrap();
        let acquired = AtomicBool::new(false);

        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let guard = pool.acquire(&liveness, POLL).unwrap();
                acquired.store(true, Ordering::SeqCst);
                guard.index()
            });

            thread::sleep(Duration::from_millis(50));
            assert!(!acquired.load(Ordering::SeqCst));

            drop(held);
            assert_eq!(waiter.join().unwrap(), 0);
        });
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_waiting_on_dead_worker_fails() {
        let pool = SlotPool::new(1);
        let liveness = FakeLiveness::alive();
        let _held = pool.acquire(&liveness, POLL).unwrap();

        liveness.kill();
        let err = pool.acquire(&liveness, POLL).unwrap_err();
        assert_eq!(err.status, Status::Unreachable);
        assert_eq!(pool.in_flight(), 1);
    }
}
