//! Dedicated property-reader channel.
//!
//! Property reads get their own worker loop so that a monitoring caller is
//! not stuck behind long-running calls in the request pool. The channel is
//! guarded by an advisory lock with a short acquisition timeout: when another
//! reader already holds it, the read falls back to the request pool instead
//! of queueing.

use super::channel::CallerEnd;
use super::liveness::Liveness;
use super::pool::RequestPool;
use super::protocol::{RequestEnvelope, ResponseEnvelope};
use crate::error::RemoteError;
use crossbeam_channel::{Receiver, Sender, bounded};
use std::time::Duration;
use tracing::debug;

/// Single-holder lock with a timed acquire.
#[derive(Debug)]
pub struct AdvisoryLock {
    take: Receiver<()>,
    give: Sender<()>,
}

impl AdvisoryLock {
    pub fn new() -> Self {
        let (give, take) = bounded(1);
        // Infallible: the channel has room for the single token and `take` is alive.
        let _ = give.send(());
        Self { take, give }
    }

    /// Try to take the lock, waiting at most `timeout`.
    pub fn try_acquire(&self, timeout: Duration) -> Option<LockGuard<'_>> {
        self.take.recv_timeout(timeout).ok().map(|()| LockGuard { lock: self })
    }

    #[cfg(test)]
    pub fn is_held(&self) -> bool {
        self.take.is_empty()
    }
}

impl Default for AdvisoryLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the [`AdvisoryLock`] on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a AdvisoryLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.give.try_send(());
    }
}

/// Parent side of the reader loop.
#[derive(Debug)]
pub struct ReaderChannel {
    lock: AdvisoryLock,
    channel: CallerEnd,
    lock_timeout: Duration,
    poll_interval: Duration,
}

impl ReaderChannel {
    pub fn new(channel: CallerEnd, lock_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            lock: AdvisoryLock::new(),
            channel,
            lock_timeout,
            poll_interval,
        }
    }

    /// Send `request` on the reader channel, or through `pool` if the reader
    /// is busy.
    pub fn call(
        &self,
        request: &RequestEnvelope,
        pool: &RequestPool,
        liveness: &dyn Liveness,
    ) -> Result<ResponseEnvelope, RemoteError> {
        match self.lock.try_acquire(self.lock_timeout) {
            Some(_guard) => self.channel.round_trip(request, liveness, self.poll_interval),
            None => {
                debug!(operation = %request.operation, "Reader channel busy, using request pool");
                pool.call(request, liveness)
            }
        }
    }

    #[cfg(test)]
    pub fn lock(&self) -> &AdvisoryLock {
        &self.lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::channel::{ChannelPair, ResponderEnd};
    use crate::worker::liveness::testing::FakeLiveness;
    use crate::worker::protocol::Status;
    use serde_json::json;
    use std::thread;
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(20);

    /// Answers every request with `tag`.
    fn tagged_responder(mut responder: ResponderEnd, tag: &'static str) {
        thread::spawn(move || {
            while let Ok(Some(Ok(_))) = responder.next_request() {
                if responder.respond(&ResponseEnvelope::ok(json!(tag))).is_err() {
                    break;
                }
            }
        });
    }

    fn pool_answering(tag: &'static str) -> RequestPool {
        let (caller, responder) = ChannelPair::open().unwrap().split();
        tagged_responder(responder, tag);
        RequestPool::new(vec![caller], POLL)
    }

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let lock = AdvisoryLock::new();
        let guard = lock.try_acquire(Duration::from_millis(10)).unwrap();
        assert!(lock.is_held());

        let start = Instant::now();
        assert!(lock.try_acquire(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));

        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_acquire(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_free_reader_uses_reader_channel() {
        let (caller, responder) = ChannelPair::open().unwrap().split();
        tagged_responder(responder, "reader");
        let reader = ReaderChannel::new(caller, Duration::from_millis(100), POLL);
        let pool = pool_answering("pool");

        let liveness = FakeLiveness::alive();
        let response = reader.call(&RequestEnvelope::bare("count"), &pool, &liveness).unwrap();
        assert_eq!(response.data, json!("reader"));
        assert!(!reader.lock().is_held());
    }

    #[test]
    fn test_busy_reader_falls_back_to_pool() {
        // Reader loop never answers; only the pool does.
        let (caller, _responder) = ChannelPair::open().unwrap().split();
        let reader = ReaderChannel::new(caller, Duration::from_millis(30), POLL);
        let pool = pool_answering("pool");
        let liveness = FakeLiveness::alive();

        let _held = reader.lock().try_acquire(Duration::from_millis(10)).unwrap();
        let response = reader.call(&RequestEnvelope::bare("count"), &pool, &liveness).unwrap();
        assert_eq!(response.data, json!("pool"));
    }

    #[test]
    fn test_lock_released_after_failed_read() {
        let (caller, responder) = ChannelPair::open().unwrap().split();
        drop(responder);
        let reader = ReaderChannel::new(caller, Duration::from_millis(30), POLL);
        let pool = pool_answering("pool");
        let liveness = FakeLiveness::alive();

        let err = reader.call(&RequestEnvelope::bare("count"), &pool, &liveness).unwrap_err();
        assert_eq!(err.status, Status::Unreachable);
        assert!(!reader.lock().is_held());
    }
}
