//! Operation registration.
//!
//! Every operation a worker exposes is declared once, at construction, with
//! its capability: callable remotely, readable as a cached property, or run
//! periodically inside the worker. The validated table drives both request
//! routing and which background loops the worker starts.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::{IprocError, Result};

/// Name of the built-in state inspection operation.
pub const INTERFACES: &str = "interfaces";

/// Registry key holding the main routine's failure.
pub const ERROR_KEY: &str = "__error__";

const RESERVED: &[&str] = &[INTERFACES, ERROR_KEY];

/// Failure of a worker-side operation.
#[derive(Debug, Error)]
pub enum OpError {
    /// The caller passed the wrong number or type of arguments.
    #[error("{0}")]
    BadArguments(String),

    /// The operation itself failed.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl OpError {
    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::BadArguments(message.into())
    }
}

/// Arguments of one call, resolved by position or by keyword.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a> {
    positional: &'a [Value],
    named: &'a Map<String, Value>,
}

impl<'a> Args<'a> {
    pub fn new(positional: &'a [Value], named: &'a Map<String, Value>) -> Self {
        Self { positional, named }
    }

    /// Total number of arguments supplied.
    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject calls with more positional arguments than `params`, or with
    /// keywords that are not in `params`.
    pub fn expect_params<P: AsRef<str>>(&self, params: &[P]) -> std::result::Result<(), OpError> {
        if self.positional.len() > params.len() {
            return Err(OpError::bad_arguments(format!(
                "takes {} positional argument(s) but {} were given",
                params.len(),
                self.positional.len()
            )));
        }
        for key in self.named.keys() {
            match params.iter().position(|p| p.as_ref() == key) {
                None => {
                    return Err(OpError::bad_arguments(format!(
                        "got an unexpected keyword argument `{key}`"
                    )));
                }
                Some(index) if index < self.positional.len() => {
                    return Err(OpError::bad_arguments(format!(
                        "got multiple values for argument `{key}`"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Required argument at `index`, or the keyword `name`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize, name: &str) -> std::result::Result<T, OpError> {
        self.optional(index, name)?
            .ok_or_else(|| OpError::bad_arguments(format!("missing required argument `{name}`")))
    }

    /// Optional argument at `index`, or the keyword `name`.
    pub fn optional<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> std::result::Result<Option<T>, OpError> {
        let value = self.positional.get(index).or_else(|| self.named.get(name));
        value
            .map(|v| {
                T::deserialize(v).map_err(|e| {
                    OpError::bad_arguments(format!("invalid value for argument `{name}`: {e}"))
                })
            })
            .transpose()
    }
}

type CallFn<S> = dyn Fn(&S, Args<'_>) -> std::result::Result<Value, OpError> + Send + Sync;
type PropertyFn<S> = dyn Fn(&S) -> std::result::Result<Value, OpError> + Send + Sync;
type TickFn<S> = dyn Fn(&S) -> std::result::Result<Option<f64>, OpError> + Send + Sync;

/// Capability of a registered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Callable,
    Property,
    Periodic(Duration),
}

/// A registered operation, bound to its implementation.
pub enum Operation<S> {
    /// Dispatched through the request pool from outside the worker. Calls
    /// are checked against `params` before `call` runs.
    Callable { params: Vec<String>, call: Arc<CallFn<S>> },
    /// Read-only value, served by the reader channel and cached at exit.
    Property(Arc<PropertyFn<S>>),
    /// Run inside the worker every `interval`; never callable remotely.
    Periodic { interval: Duration, tick: Arc<TickFn<S>> },
}

impl<S> Operation<S> {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Callable { .. } => Capability::Callable,
            Self::Property(_) => Capability::Property,
            Self::Periodic { interval, .. } => Capability::Periodic(*interval),
        }
    }
}

impl<S> Clone for Operation<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Callable { params, call } => Self::Callable {
                params: params.clone(),
                call: Arc::clone(call),
            },
            Self::Property(f) => Self::Property(Arc::clone(f)),
            Self::Periodic { interval, tick } => Self::Periodic {
                interval: *interval,
                tick: Arc::clone(tick),
            },
        }
    }
}

impl<S> fmt::Debug for Operation<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation::{:?}", self.capability())
    }
}

fn to_value<R: Serialize>(value: R) -> std::result::Result<Value, OpError> {
    serde_json::to_value(value)
        .map_err(|e| OpError::Failed(anyhow::Error::new(e).context("result is not serializable")))
}

/// Builder collecting operation declarations.
pub struct Registry<S> {
    entries: Vec<(String, Operation<S>)>,
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<S: 'static> Registry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a remotely callable operation taking the arguments `params`.
    ///
    /// Surplus positional arguments and unknown keywords are rejected with
    /// `BadArguments` before `f` runs; missing ones surface when `f` reads
    /// them.
    pub fn callable<R, F>(&mut self, name: &str, params: &[&str], f: F) -> &mut Self
    where
        R: Serialize,
        F: Fn(&S, Args<'_>) -> std::result::Result<R, OpError> + Send + Sync + 'static,
    {
        let call = move |service: &S, args: Args<'_>| f(service, args).and_then(to_value);
        let operation = Operation::Callable {
            params: params.iter().map(|p| p.to_string()).collect(),
            call: Arc::new(call),
        };
        self.entries.push((name.to_string(), operation));
        self
    }

    /// Declare a read-only property.
    pub fn property<R, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        R: Serialize,
        F: Fn(&S) -> R + Send + Sync + 'static,
    {
        let read = move |service: &S| to_value(f(service));
        self.entries
            .push((name.to_string(), Operation::Property(Arc::new(read))));
        self
    }

    /// Declare a periodic maintenance task.
    ///
    /// Returning `Some(seconds)` with a positive value replaces the interval
    /// for the following cycles.
    pub fn periodic<F>(&mut self, name: &str, interval: Duration, f: F) -> &mut Self
    where
        F: Fn(&S) -> std::result::Result<Option<f64>, OpError> + Send + Sync + 'static,
    {
        self.entries.push((
            name.to_string(),
            Operation::Periodic {
                interval,
                tick: Arc::new(f),
            },
        ));
        self
    }

    /// Validate the declarations into an immutable table.
    pub fn build(self) -> Result<Operations<S>> {
        let mut table = BTreeMap::new();
        for (name, operation) in self.entries {
            if name.is_empty() {
                return Err(IprocError::Registration("operation name is empty".into()));
            }
            if RESERVED.contains(&name.as_str()) {
                return Err(IprocError::Registration(format!("`{name}` is a reserved name")));
            }
            if table.insert(name.clone(), operation).is_some() {
                return Err(IprocError::Registration(format!(
                    "operation `{name}` is registered twice"
                )));
            }
        }
        Ok(Operations { table })
    }
}

/// Validated, immutable operation table.
pub struct Operations<S> {
    table: BTreeMap<String, Operation<S>>,
}

impl<S> Operations<S> {
    pub fn get(&self, name: &str) -> Option<&Operation<S>> {
        self.table.get(name)
    }

    pub fn capability(&self, name: &str) -> Option<Capability> {
        self.get(name).map(Operation::capability)
    }

    /// Names of all registered properties, in sorted order.
    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.table
            .iter()
            .filter(|(_, op)| matches!(op, Operation::Property(_)))
            .map(|(name, _)| name.as_str())
    }

    /// Periodic tasks with their initial interval.
    pub fn periodic(&self) -> impl Iterator<Item = (&str, Duration, Arc<TickFn<S>>)> {
        self.table.iter().filter_map(|(name, op)| match op {
            Operation::Periodic { interval, tick } => Some((name.as_str(), *interval, Arc::clone(tick))),
            _ => None,
        })
    }

    /// Evaluate a property in the current process.
    pub fn read_property(&self, service: &S, name: &str) -> Option<std::result::Result<Value, OpError>> {
        match self.get(name)? {
            Operation::Property(read) => Some(read(service)),
            _ => None,
        }
    }
}

impl<S> fmt::Debug for Operations<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.table.iter().map(|(k, v)| (k, v.capability())))
            .finish()
    }
}
