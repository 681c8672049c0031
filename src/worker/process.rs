//! The parent-side worker handle.
//!
//! A [`Worker`] owns the worker-side object, its operation table and every
//! channel to the child. After [`Worker::start`] the same value exists in
//! both processes; each method checks the execution context (the worker's
//! pid against the current pid) to decide whether to run locally or to go
//! through a channel.

use super::channel::ChannelPair;
use super::dispatch::{Dispatcher, Interfaces, StateTable};
use super::liveness::Liveness;
use super::pool::RequestPool;
use super::proc::Proc;
use super::protocol::{RequestEnvelope, ResponseEnvelope, Status};
use super::reader::ReaderChannel;
use super::registry::{Capability, INTERFACES, Operations, Registry};
use super::signals::TerminationReason;
use super::snapshot::{HandoffReceiver, HandoffSender, PropertyRegistry, ReadyFlag, handoff, spawn_collector};
use super::spawn::{self, Forked};
use super::worker_main::{self, ChildEnds, READER_LOOP, request_loop_name};
use crate::config::WorkerConfig;
use crate::error::{IprocError, RemoteError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// An object whose operations run inside a worker process.
pub trait Service: Send + Sync + Sized + 'static {
    /// Declare the object's callables, properties and periodic tasks.
    fn register(registry: &mut Registry<Self>);

    /// The worker's main routine. The worker exits when it returns.
    fn run(&self, worker: &Worker<Self>) -> anyhow::Result<()>;
}

/// Liveness report for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keepalive {
    pub alive: bool,
    /// Only present once the worker has exited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exitcode: Option<i32>,
    pub error: Option<String>,
    pub traceback: Option<String>,
}

/// Channels created at construction, consumed by `start`.
struct Pending {
    requests: Vec<ChannelPair>,
    reader: ChannelPair,
    handoff: (HandoffSender, HandoffReceiver),
}

/// Parent-side state of a running worker.
struct Started {
    proc: Proc,
    pool: RequestPool,
    reader: ReaderChannel,
}

/// Handle to a service running in its own worker process.
pub struct Worker<S: Service> {
    service: Arc<S>,
    operations: Arc<Operations<S>>,
    states: StateTable,
    dispatcher: Dispatcher<S>,
    config: WorkerConfig,
    pending: Mutex<Option<Pending>>,
    started: OnceLock<Started>,
    /// Pid of the worker process, set on both sides of the fork.
    context: OnceLock<u32>,
    snapshot: Arc<ReadyFlag>,
}

impl<S: Service> Worker<S> {
    /// Register `service`'s operations and open every channel.
    pub fn new(service: S, config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        let mut registry = Registry::new();
        S::register(&mut registry);
        let operations = Arc::new(registry.build()?);

        let names = (0..config.threads)
            .map(request_loop_name)
            .chain(std::iter::once(READER_LOOP.to_string()));
        let states = StateTable::new(names);

        let requests = (0..config.threads)
            .map(|_| ChannelPair::open())
            .collect::<std::io::Result<Vec<_>>>()?;
        let pending = Pending {
            requests,
            reader: ChannelPair::open()?,
            handoff: handoff()?,
        };

        let service = Arc::new(service);
        let dispatcher = Dispatcher::new(Arc::clone(&service), Arc::clone(&operations), states.clone());
        debug!(threads = config.threads, operations = ?operations, "Worker created");

        Ok(Self {
            service,
            operations,
            states,
            dispatcher,
            config,
            pending: Mutex::new(Some(pending)),
            started: OnceLock::new(),
            context: OnceLock::new(),
            snapshot: Arc::new(ReadyFlag::new()),
        })
    }

    /// Fork the worker process and start its loops and main routine.
    ///
    /// Returns in the parent only; the child exits when the main routine ends.
    pub fn start(&self) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(IprocError::AlreadyStarted)?;

        let mut callers = Vec::with_capacity(pending.requests.len());
        let mut responders = Vec::with_capacity(pending.requests.len());
        for pair in pending.requests {
            let (caller, responder) = pair.split();
            callers.push(caller);
            responders.push(responder);
        }
        let (reader_caller, reader_responder) = pending.reader.split();
        let (handoff_sender, handoff_receiver) = pending.handoff;

        match spawn::fork()? {
            Forked::Child => {
                let _ = self.context.set(std::process::id());
                drop((callers, reader_caller, handoff_receiver));
                let ends = ChildEnds {
                    requests: responders,
                    reader: reader_responder,
                    handoff: handoff_sender,
                };
                spawn::exit(worker_main::run(self, ends))
            }
            Forked::Parent(pid) => {
                drop((responders, reader_responder, handoff_sender));
                let _ = self.context.set(pid.as_raw() as u32);
                spawn_collector(handoff_receiver, Arc::clone(&self.snapshot))?;

                let poll = self.config.poll_interval;
                let started = Started {
                    proc: Proc::new(pid),
                    pool: RequestPool::new(callers, poll),
                    reader: ReaderChannel::new(reader_caller, self.config.reader_lock_timeout, poll),
                };
                let _ = self.started.set(started);
                info!(pid = pid.as_raw(), threads = self.config.threads, "Worker started");
                Ok(())
            }
        }
    }

    /// Check if the current code runs inside the worker process.
    pub fn in_worker(&self) -> bool {
        self.context.get() == Some(&std::process::id())
    }

    pub fn pid(&self) -> Option<u32> {
        self.context.get().copied()
    }

    pub fn is_started(&self) -> bool {
        self.context.get().is_some()
    }

    pub fn is_alive(&self) -> bool {
        if self.in_worker() {
            return true;
        }
        self.started.get().is_some_and(|s| s.proc.is_running())
    }

    /// Exit code once the worker has exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.started.get().and_then(|s| s.proc.termination()).and_then(|r| r.exit_code())
    }

    /// Number of pool calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.started.get().map_or(0, |s| s.pool.slots().in_flight())
    }

    /// Call a remote operation with positional arguments.
    pub fn call(&self, operation: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with(operation, args, Map::new())
    }

    /// Call a remote operation with positional and keyword arguments.
    #[instrument(level = "debug", skip(self, args, kwargs))]
    pub fn call_with(&self, operation: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
        let request = RequestEnvelope::new(operation, args, kwargs);
        if self.in_worker() {
            return into_data(self.dispatcher.handle(&request));
        }
        let started = self.live()?;
        into_data(started.pool.call(&request, &started.proc)?)
    }

    /// Read a property.
    ///
    /// Evaluated in place inside the worker or before it starts; served from
    /// the snapshot once the worker has exited. A read cut short by the
    /// worker exiting waits up to one poll interval for the snapshot to land.
    pub fn property(&self, name: &str) -> Result<Value> {
        if self.operations.capability(name) != Some(Capability::Property) {
            return Err(RemoteError::bad_arguments(format!("no property named `{name}`")).into());
        }
        let Some(started) = self.started.get().filter(|_| !self.in_worker()) else {
            return self.read_local(name);
        };

        if !started.proc.is_running()
            && let Some(snapshot) = self.snapshot.get()
        {
            return Ok(cached(&snapshot, name));
        }

        let request = RequestEnvelope::bare(name);
        match started.reader.call(&request, &started.pool, &started.proc) {
            Ok(response) => into_data(response),
            Err(e) if e.status == Status::Unreachable => {
                match self.snapshot.wait(self.config.poll_interval) {
                    Some(snapshot) => {
                        debug!(property = name, "Worker gone, serving cached property");
                        Ok(cached(&snapshot, name))
                    }
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// What every worker loop is doing, or `None` once the worker has exited.
    pub fn interfaces(&self) -> Result<Option<Interfaces>> {
        let Some(started) = self.started.get().filter(|_| !self.in_worker()) else {
            return Ok(Some(self.states.interfaces()));
        };
        if !started.proc.is_running() {
            return Ok(None);
        }
        let request = RequestEnvelope::bare(INTERFACES);
        match started.reader.call(&request, &started.pool, &started.proc) {
            Ok(response) => Ok(Some(serde_json::from_value(into_data(response)?)?)),
            Err(e) if e.status == Status::Unreachable => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Liveness report, including the main routine's error once it failed.
    pub fn keepalive(&self) -> Result<Keepalive> {
        if self.in_worker() {
            return Ok(Keepalive {
                alive: true,
                exitcode: None,
                error: None,
                traceback: None,
            });
        }
        let started = self.started.get().ok_or(IprocError::NotStarted)?;
        let alive = started.proc.is_running();
        let failure = self.snapshot.get().and_then(|s| s.error());
        Ok(Keepalive {
            alive,
            exitcode: if alive { None } else { started.proc.exit_code() },
            error: failure.as_ref().map(|f| f.error.clone()),
            traceback: failure.map(|f| f.traceback),
        })
    }

    /// The property snapshot, if the worker has published it.
    pub fn snapshot(&self) -> Option<Arc<PropertyRegistry>> {
        self.snapshot.get()
    }

    /// Wait up to `timeout` for the property snapshot.
    pub fn wait_snapshot(&self, timeout: Duration) -> Option<Arc<PropertyRegistry>> {
        self.snapshot.wait(timeout)
    }

    /// Wait up to `timeout` for the worker to exit.
    ///
    /// After a normal exit this also waits, within the same budget, for the
    /// property snapshot to arrive.
    pub fn join(&self, timeout: Duration) -> Result<Option<TerminationReason>> {
        let started = self.started.get().ok_or(IprocError::NotStarted)?;
        let deadline = Instant::now() + timeout;
        let reason = started.proc.wait_timeout(timeout);
        if let Some(TerminationReason::Exited(_)) = reason {
            self.snapshot.wait(deadline.saturating_duration_since(Instant::now()));
        }
        Ok(reason)
    }

    /// Ask the worker to stop (SIGTERM).
    pub fn terminate(&self) -> Result<()> {
        self.started.get().ok_or(IprocError::NotStarted)?.proc.terminate()
    }

    /// Stop the worker immediately (SIGKILL).
    pub fn kill(&self) -> Result<()> {
        self.started.get().ok_or(IprocError::NotStarted)?.proc.kill()
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn operations(&self) -> &Operations<S> {
        &self.operations
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub(crate) fn shared_service(&self) -> &Arc<S> {
        &self.service
    }

    pub(crate) fn states(&self) -> &StateTable {
        &self.states
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    /// Parent-side state, failing with `Unreachable` unless the worker runs.
    fn live(&self) -> std::result::Result<&Started, RemoteError> {
        match self.started.get() {
            Some(started) if started.proc.is_running() => Ok(started),
            Some(started) => Err(RemoteError::unreachable(started.proc.exit_code())),
            None => Err(RemoteError::unreachable(None)),
        }
    }

    fn read_local(&self, name: &str) -> Result<Value> {
        into_data(self.dispatcher.handle(&RequestEnvelope::bare(name)))
    }
}

impl<S: Service> std::fmt::Debug for Worker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid())
            .field("config", &self.config)
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

fn into_data(response: ResponseEnvelope) -> Result<Value> {
    if response.is_ok() {
        Ok(response.data)
    } else {
        Err(RemoteError::from(response).into())
    }
}

fn cached(snapshot: &PropertyRegistry, name: &str) -> Value {
    snapshot.get(name).cloned().unwrap_or(Value::Null)
}
