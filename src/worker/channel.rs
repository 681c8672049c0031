//! Request/response channel pairs.
//!
//! A [`ChannelPair`] is two pipes: requests flow parent → worker, responses
//! flow worker → parent. Pairs are opened before the fork and split
//! afterwards; each process keeps only its own ends so that the death of
//! either side shows up as EOF on the other.

use super::ipc::{LineRead, LineReader, LineWriter, pipe};
use super::liveness::{Liveness, Polled, wait_alive};
use super::protocol::{RequestEnvelope, ResponseEnvelope};
use crate::error::RemoteError;
use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::warn;

/// Both ends of one request/response conversation.
#[derive(Debug)]
pub struct ChannelPair {
    caller: CallerEnd,
    responder: ResponderEnd,
}

impl ChannelPair {
    pub fn open() -> io::Result<Self> {
        let (request_read, request_write) = pipe()?;
        let (response_read, response_write) = pipe()?;
        Ok(Self {
            caller: CallerEnd {
                requests: Mutex::new(LineWriter::new(request_write)),
                responses: Mutex::new(LineReader::new(response_read)),
            },
            responder: ResponderEnd {
                requests: LineReader::new(request_read),
                responses: LineWriter::new(response_write),
            },
        })
    }

    /// Separate the parent-side end from the worker-side end.
    pub fn split(self) -> (CallerEnd, ResponderEnd) {
        (self.caller, self.responder)
    }
}

/// Parent-side end: sends requests, waits for responses.
///
/// Callers are expected to hold the matching slot (or the reader lock) for
/// the whole round-trip; the internal mutexes only make the type `Sync`.
#[derive(Debug)]
pub struct CallerEnd {
    requests: Mutex<LineWriter>,
    responses: Mutex<LineReader>,
}

impl CallerEnd {
    /// Send `request` and wait for its response, re-checking liveness every
    /// `poll_interval`.
    pub fn round_trip(
        &self,
        request: &RequestEnvelope,
        liveness: &dyn Liveness,
        poll_interval: Duration,
    ) -> Result<ResponseEnvelope, RemoteError> {
        self.send(request, liveness)?;
        self.receive(liveness, poll_interval)
    }

    fn send(&self, request: &RequestEnvelope, liveness: &dyn Liveness) -> Result<(), RemoteError> {
        let line = request.to_line().map_err(|e| RemoteError {
            status: super::protocol::Status::BadArguments,
            data: format!("Arguments are not serializable: {e}").into(),
            traceback: None,
        })?;
        let mut writer = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_line(&line).map_err(|e| {
            warn!(operation = %request.operation, error = %e, "Failed to send request to worker");
            RemoteError::unreachable(liveness.exit_code())
        })
    }

    fn receive(
        &self,
        liveness: &dyn Liveness,
        poll_interval: Duration,
    ) -> Result<ResponseEnvelope, RemoteError> {
        let mut reader = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        wait_alive(liveness, poll_interval, |timeout| {
            match reader.read_line_timeout(timeout) {
                Ok(LineRead::Line(line)) => Polled::Ready(match ResponseEnvelope::from_line(&line) {
                    Ok(response) => response,
                    Err(e) => ResponseEnvelope::internal(format!("Invalid worker response: {e}"), line),
                }),
                Ok(LineRead::Timeout) => Polled::Pending,
                Ok(LineRead::Eof) => Polled::Closed,
                Err(e) => {
                    warn!(error = %e, "Failed to receive from worker");
                    Polled::Closed
                }
            }
        })
    }
}

/// Worker-side end: reads requests one at a time, writes responses.
#[derive(Debug)]
pub struct ResponderEnd {
    requests: LineReader,
    responses: LineWriter,
}

impl ResponderEnd {
    /// Block for the next request line.
    ///
    /// Returns `None` once the parent has closed its end.
    pub fn next_request(&mut self) -> io::Result<Option<Result<RequestEnvelope, serde_json::Error>>> {
        Ok(self.requests.read_line()?.map(RequestEnvelope::from_line))
    }

    pub fn respond(&mut self, response: &ResponseEnvelope) -> io::Result<()> {
        let line = response.to_line().map_err(io::Error::other)?;
        self.responses.write_line(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::liveness::testing::FakeLiveness;
    use crate::worker::protocol::Status;
    use serde_json::json;
    use std::thread;

    const POLL: Duration = Duration::from_millis(20);

    #[test]
    fn test_round_trip_with_echo_responder() {
        let (caller, mut responder) = ChannelPair::open().unwrap().split();

        let echo = thread::spawn(move || {
            while let Some(request) = responder.next_request().unwrap() {
                let request = request.unwrap();
                let reply = ResponseEnvelope::ok(json!({ "echo": request.operation }));
                responder.respond(&reply).unwrap();
            }
        });

        let liveness = FakeLiveness::alive();
        for name in ["first", "second"] {
            let response = caller
                .round_trip(&RequestEnvelope::bare(name), &liveness, POLL)
                .unwrap();
            assert!(response.is_ok());
            assert_eq!(response.data, json!({ "echo": name }));
        }

        drop(caller);
        echo.join().unwrap();
    }

    #[test]
    fn test_closed_responder_is_unreachable() {
        let (caller, responder) = ChannelPair::open().unwrap().split();
        drop(responder);

        let liveness = FakeLiveness::alive();
        let err = caller
            .round_trip(&RequestEnvelope::bare("anything"), &liveness, POLL)
            .unwrap_err();
        assert_eq!(err.status, Status::Unreachable);
    }

    #[test]
    fn test_silent_dead_worker_is_unreachable() {
        // Responder stays open but never answers; only liveness can end the wait.
        let (caller, _responder) = ChannelPair::open().unwrap().split();
        let liveness = FakeLiveness::alive();

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                liveness.kill();
            });
            let err = caller
                .round_trip(&RequestEnvelope::bare("hang"), &liveness, POLL)
                .unwrap_err();
            assert_eq!(err.status, Status::Unreachable);
        });
    }

    /// Caller end reading from a pipe the test writes raw bytes into.
    fn raw_caller() -> (CallerEnd, crate::worker::ipc::PipeFd) {
        let (_, request_write) = pipe().unwrap();
        let (response_read, response_write) = pipe().unwrap();
        let caller = CallerEnd {
            requests: Mutex::new(LineWriter::new(request_write)),
            responses: Mutex::new(LineReader::new(response_read)),
        };
        (caller, response_write)
    }

    #[test]
    fn test_response_cut_off_by_death_is_unreachable() {
        use std::io::Write;

        let (caller, mut responses) = raw_caller();
        responses.write_all(br#"{"status":200,"data":"aaaa"#).unwrap();
        drop(responses);

        let err = caller.receive(&FakeLiveness::dead(), POLL).unwrap_err();
        assert_eq!(err.status, Status::Unreachable);
    }

    #[test]
    fn test_half_written_response_does_not_block_liveness_checks() {
        use std::io::Write;

        let (caller, mut responses) = raw_caller();
        responses.write_all(br#"{"status":200,"data":"aa"#).unwrap();
        let liveness = FakeLiveness::alive();

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                liveness.kill();
            });
            let err = caller.receive(&liveness, POLL).unwrap_err();
            assert_eq!(err.status, Status::Unreachable);
        });
        drop(responses);
    }

    #[test]
    fn test_garbage_response_becomes_internal_failure() {
        let (caller, responder) = ChannelPair::open().unwrap().split();
        let ResponderEnd { mut responses, .. } = responder;
        responses.write_line("not json").unwrap();

        let liveness = FakeLiveness::alive();
        let response = caller.receive(&liveness, POLL).unwrap();
        assert_eq!(response.status, Status::InternalFailure);
        assert_eq!(response.traceback.as_deref(), Some("not json"));
    }
}
