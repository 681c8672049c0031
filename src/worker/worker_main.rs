//! Worker process body.
//!
//! Runs in the forked child: starts the request loops, the reader loop and
//! one timer per periodic operation, then runs the main routine. When the
//! routine ends, however it ends, the property snapshot is published and the
//! exit code is returned to the caller, which leaves the process with it.

use super::channel::ResponderEnd;
use super::dispatch::{Dispatcher, StateTable, panic_message};
use super::process::{Service, Worker};
use super::registry::Operations;
use super::snapshot::{ErrorRecord, HandoffSender, PropertyRegistry};
use super::spawn::spawn_named_thread;
use super::timer::TimerLoop;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// Name of the `index`-th request loop.
pub fn request_loop_name(index: usize) -> String {
    format!("request-{index}")
}

/// Name of the reader loop.
pub const READER_LOOP: &str = "reader";

/// Everything the child needs, split off its side of the fork.
pub(crate) struct ChildEnds {
    pub requests: Vec<ResponderEnd>,
    pub reader: ResponderEnd,
    pub handoff: HandoffSender,
}

/// Run the worker to completion and return its exit code.
pub(crate) fn run<S: Service>(worker: &Worker<S>, ends: ChildEnds) -> i32 {
    let ChildEnds {
        requests,
        reader,
        handoff,
    } = ends;
    let shutdown = Arc::new(AtomicBool::new(false));

    let mut failure = start_loops(worker.dispatcher(), worker.states(), requests, reader).err();
    if failure.is_none() {
        failure = start_timers(worker.operations(), worker.shared_service(), &shutdown).err();
    }

    if failure.is_none() {
        info!(pid = std::process::id(), "Worker main routine starting");
        failure = match catch_unwind(AssertUnwindSafe(|| worker.service().run(worker))) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(ErrorRecord {
                error: e.to_string(),
                traceback: format!("{e:?}"),
            }),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                Some(ErrorRecord {
                    traceback: format!("main routine panicked: {message}"),
                    error: message,
                })
            }
        };
    }
    shutdown.store(true, Ordering::Relaxed);

    let code = match &failure {
        None => 0,
        Some(record) => {
            error!(error = %record.error, "Worker main routine failed");
            1
        }
    };

    let snapshot = PropertyRegistry::capture(worker.operations(), worker.service(), failure);
    if let Err(e) = handoff.publish(&snapshot) {
        error!(error = %e, "Failed to publish property snapshot");
    }
    debug!(code, properties = snapshot.len(), "Worker finished");
    code
}

fn start_loops<S: Send + Sync + 'static>(
    dispatcher: &Dispatcher<S>,
    states: &StateTable,
    requests: Vec<ResponderEnd>,
    reader: ResponderEnd,
) -> Result<(), ErrorRecord> {
    let names = (0..requests.len()).map(request_loop_name);
    let loops = names
        .zip(requests)
        .chain(std::iter::once((READER_LOOP.to_string(), reader)));

    for (name, responder) in loops {
        let handle = states.handle(&name).ok_or_else(|| ErrorRecord {
            error: format!("no state slot for loop `{name}`"),
            traceback: "starting worker loops".to_string(),
        })?;
        let dispatcher = dispatcher.clone();
        spawn_named_thread(&name, move || dispatcher.serve(&handle, responder)).map_err(|e| {
            ErrorRecord {
                error: e.to_string(),
                traceback: format!("spawning loop `{name}`: {e:?}"),
            }
        })?;
    }
    Ok(())
}

fn start_timers<S: Send + Sync + 'static>(
    operations: &Operations<S>,
    service: &Arc<S>,
    shutdown: &Arc<AtomicBool>,
) -> Result<(), ErrorRecord> {
    for (name, interval, tick) in operations.periodic() {
        let timer = TimerLoop::new(name, interval, tick, Arc::clone(service));
        timer.spawn(Arc::clone(shutdown)).map_err(|e| ErrorRecord {
            error: e.to_string(),
            traceback: format!("spawning timer `{name}`: {e:?}"),
        })?;
        debug!(timer = name, interval_secs = interval.as_secs_f64(), "Timer started");
    }
    Ok(())
}
