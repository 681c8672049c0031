//! Post-mortem property snapshot.
//!
//! When the worker's main routine ends, every registered property is
//! evaluated one last time inside the worker and the resulting
//! [`PropertyRegistry`] is handed to the parent over a single-shot pipe. A
//! collector thread in the parent receives it and sets the [`ReadyFlag`], after
//! which property reads no longer need a live worker.

use super::dispatch::panic_message;
use super::ipc::{LineReader, LineWriter, pipe};
use super::registry::{ERROR_KEY, Operations};
use super::spawn::spawn_named_thread;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Failure of the worker's main routine, as recorded under `__error__`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error: String,
    pub traceback: String,
}

/// Property values captured when the worker finished.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyRegistry {
    values: BTreeMap<String, Value>,
}

impl PropertyRegistry {
    /// Registry with every property name present and unset.
    pub fn empty<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            values: names.into_iter().map(|n| (n.to_string(), Value::Null)).collect(),
        }
    }

    /// Evaluate every property of `service` in the current process.
    ///
    /// A property that fails or panics keeps a null value.
    pub fn capture<S>(operations: &Operations<S>, service: &S, failure: Option<ErrorRecord>) -> Self {
        let mut registry = Self::empty(operations.properties());
        for (name, value) in registry.values.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| operations.read_property(service, name))) {
                Ok(Some(Ok(v))) => *value = v,
                Ok(Some(Err(e))) => warn!(property = %name, error = %e, "Failed to capture property"),
                Ok(None) => {}
                Err(payload) => warn!(
                    property = %name,
                    panic = %panic_message(payload.as_ref()),
                    "Property panicked during capture"
                ),
            }
        }
        if let Some(failure) = failure {
            match serde_json::to_value(failure) {
                Ok(v) => {
                    registry.values.insert(ERROR_KEY.to_string(), v);
                }
                Err(e) => warn!(error = %e, "Failed to record main routine error"),
            }
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// The main routine's failure, if it had one.
    pub fn error(&self) -> Option<ErrorRecord> {
        self.values
            .get(ERROR_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Set-once latch holding the snapshot.
#[derive(Debug, Default)]
pub struct ReadyFlag {
    registry: Mutex<Option<Arc<PropertyRegistry>>>,
    ready: Condvar,
}

impl ReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the snapshot and wake all waiters.
    ///
    /// Returns `false` if a snapshot was already set; the first one wins.
    pub fn set(&self, registry: PropertyRegistry) -> bool {
        let mut slot = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::new(registry));
        self.ready.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }

    pub fn get(&self) -> Option<Arc<PropertyRegistry>> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until the snapshot is set or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<Arc<PropertyRegistry>> {
        let slot = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let (slot, _) = self
            .ready
            .wait_timeout_while(slot, timeout, |s| s.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }
}

/// Open the single-shot handoff pipe: `(worker side, parent side)`.
pub fn handoff() -> io::Result<(HandoffSender, HandoffReceiver)> {
    let (read, write) = pipe()?;
    Ok((
        HandoffSender {
            writer: LineWriter::new(write),
        },
        HandoffReceiver {
            reader: LineReader::new(read),
        },
    ))
}

/// Worker side of the handoff.
#[derive(Debug)]
pub struct HandoffSender {
    writer: LineWriter,
}

impl HandoffSender {
    /// Publish the snapshot. Consumes the sender: there is only one handoff.
    pub fn publish(mut self, registry: &PropertyRegistry) -> io::Result<()> {
        let line = serde_json::to_string(registry).map_err(io::Error::other)?;
        self.writer.write_line(&line)
    }
}

/// Parent side of the handoff.
#[derive(Debug)]
pub struct HandoffReceiver {
    reader: LineReader,
}

impl HandoffReceiver {
    /// Wait for the snapshot; `None` if the worker died without sending one.
    pub fn receive(mut self) -> io::Result<Option<PropertyRegistry>> {
        match self.reader.read_line()? {
            Some(line) => serde_json::from_str(line).map(Some).map_err(io::Error::other),
            None => Ok(None),
        }
    }
}

/// Start the collector thread that receives the handoff and sets `flag`.
pub fn spawn_collector(receiver: HandoffReceiver, flag: Arc<ReadyFlag>) -> io::Result<JoinHandle<()>> {
    spawn_named_thread("snapshot-collector", move || match receiver.receive() {
        Ok(Some(registry)) => {
            debug!(properties = registry.len(), "Property snapshot received");
            flag.set(registry);
        }
        Ok(None) => warn!("Worker exited without publishing a property snapshot"),
        Err(e) => warn!(error = %e, "Failed to receive property snapshot"),
    })
}
