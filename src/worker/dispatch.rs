//! Worker-side request execution.
//!
//! Each worker loop owns a [`LoopHandle`] carrying its own state slot and a
//! [`ResponderEnd`]. The loop reads one request at a time, records what it is
//! doing in its slot, runs the operation through the [`Dispatcher`], and
//! answers with a status-coded envelope. Failures never escape the loop.

use super::channel::ResponderEnd;
use super::protocol::{RequestEnvelope, ResponseEnvelope};
use super::registry::{Args, INTERFACES, OpError, Operation, Operations};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, warn};

/// A call currently executing on one worker loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveCall {
    pub operation: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Time spent so far, in milliseconds.
    pub duration: f64,
}

/// Loop name → in-flight call (or `None` when idle).
pub type Interfaces = BTreeMap<String, Option<ActiveCall>>;

#[derive(Debug)]
struct CallState {
    started: Instant,
    operation: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

type StateSlot = Arc<Mutex<Option<CallState>>>;

/// Read-only view over every loop's state slot.
#[derive(Debug, Clone, Default)]
pub struct StateTable {
    loops: Arc<Vec<(String, StateSlot)>>,
}

impl StateTable {
    pub fn new<I, N>(names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let loops = names
            .into_iter()
            .map(|name| (name.into(), StateSlot::default()))
            .collect();
        Self {
            loops: Arc::new(loops),
        }
    }

    /// Handle for the loop called `name`, which becomes the slot's only writer.
    pub fn handle(&self, name: &str) -> Option<LoopHandle> {
        self.loops
            .iter()
            .find(|(n, _)| n == name)
            .map(|(name, state)| LoopHandle {
                name: name.clone(),
                state: Arc::clone(state),
            })
    }

    /// Snapshot of what every loop is doing right now.
    pub fn interfaces(&self) -> Interfaces {
        self.loops
            .iter()
            .map(|(name, state)| {
                let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                let call = state.as_ref().map(|s| ActiveCall {
                    operation: s.operation.clone(),
                    args: s.args.clone(),
                    kwargs: s.kwargs.clone(),
                    duration: s.started.elapsed().as_secs_f64() * 1000.0,
                });
                (name.clone(), call)
            })
            .collect()
    }
}

/// One worker loop's identity and state slot.
#[derive(Debug)]
pub struct LoopHandle {
    name: String,
    state: StateSlot,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn begin(&self, request: &RequestEnvelope) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(CallState {
            started: Instant::now(),
            operation: request.operation.clone(),
            args: request.args.clone(),
            kwargs: request.kwargs.clone(),
        });
    }

    fn finish(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Describe a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Executes requests against the worker-side object.
pub struct Dispatcher<S> {
    service: Arc<S>,
    operations: Arc<Operations<S>>,
    states: StateTable,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            operations: Arc::clone(&self.operations),
            states: self.states.clone(),
        }
    }
}

impl<S> Dispatcher<S> {
    pub fn new(service: Arc<S>, operations: Arc<Operations<S>>, states: StateTable) -> Self {
        Self {
            service,
            operations,
            states,
        }
    }

    /// Run one request and wrap its outcome in an envelope.
    pub fn handle(&self, request: &RequestEnvelope) -> ResponseEnvelope {
        let name = request.operation.as_str();
        let args = Args::new(&request.args, &request.kwargs);

        if name == INTERFACES {
            if !args.is_empty() {
                return bad_arguments(name, OpError::bad_arguments("`interfaces` takes no arguments"));
            }
            return match serde_json::to_value(self.states.interfaces()) {
                Ok(value) => ResponseEnvelope::ok(value),
                Err(e) => ResponseEnvelope::internal(e.to_string(), format!("{e:?}")),
            };
        }

        let Some(operation) = self.operations.get(name) else {
            return bad_arguments(name, OpError::bad_arguments(format!("no operation named `{name}`")));
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| match operation {
            Operation::Callable { params, call } => args
                .expect_params(params.as_slice())
                .and_then(|()| call(&*self.service, args)),
            Operation::Property(read) if args.is_empty() => read(&*self.service),
            Operation::Property(_) => Err(OpError::bad_arguments(format!(
                "property `{name}` takes no arguments"
            ))),
            Operation::Periodic { .. } => Err(OpError::bad_arguments(format!(
                "`{name}` is a periodic task and cannot be called remotely"
            ))),
        }));

        match outcome {
            Ok(Ok(value)) => ResponseEnvelope::ok(value),
            Ok(Err(e @ OpError::BadArguments(_))) => bad_arguments(name, e),
            Ok(Err(OpError::Failed(e))) => {
                let message = e.to_string();
                let traceback = format!("{:?}", e.context(format!("calling `{name}`")));
                ResponseEnvelope::internal(message, traceback)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                ResponseEnvelope::internal(
                    message.clone(),
                    format!("calling `{name}`\n\nCaused by:\n    panicked: {message}"),
                )
            }
        }
    }

    /// Serve requests on `responder` until the parent closes the channel.
    pub fn serve(&self, handle: &LoopHandle, mut responder: ResponderEnd) {
        loop {
            let request = match responder.next_request() {
                Ok(Some(Ok(request))) => request,
                Ok(Some(Err(e))) => {
                    let response = ResponseEnvelope::bad_arguments(
                        format!("Invalid request: {e}"),
                        format!("decoding request on `{}`", handle.name()),
                    );
                    if responder.respond(&response).is_err() {
                        return;
                    }
                    continue;
                }
                Ok(None) => {
                    debug!(loop_name = handle.name(), "Request channel closed");
                    return;
                }
                Err(e) => {
                    warn!(loop_name = handle.name(), error = %e, "Failed to read request");
                    return;
                }
            };

            debug!(
                loop_name = handle.name(),
                operation = %request.operation,
                args = ?request.args,
                kwargs = ?request.kwargs,
                "request"
            );
            handle.begin(&request);
            let response = self.handle(&request);
            handle.finish();
            debug!(
                loop_name = handle.name(),
                operation = %request.operation,
                status = response.status.code(),
                "response"
            );

            if let Err(e) = responder.respond(&response) {
                warn!(loop_name = handle.name(), error = %e, "Failed to send response");
                return;
            }
        }
    }
}

fn bad_arguments(name: &str, error: OpError) -> ResponseEnvelope {
    let message = error.to_string();
    let traceback = format!("calling `{name}`\n\nCaused by:\n    {message}");
    ResponseEnvelope::bad_arguments(message, traceback)
}
