//! Worker configuration.
//!
//! Defaults match what most callers want: one request loop, a two-second
//! liveness poll and a 100 ms reader-lock timeout. Each knob can be set with
//! a builder method or overridden from the environment.

use crate::error::{IprocError, Result};
use std::time::Duration;
use tracing::warn;

/// Number of request loops.
pub const THREADS_ENV: &str = "IPROCESS_THREADS";
/// Liveness poll interval in milliseconds.
pub const POLL_INTERVAL_ENV: &str = "IPROCESS_POLL_INTERVAL_MS";
/// Reader-lock acquisition timeout in milliseconds.
pub const READER_TIMEOUT_ENV: &str = "IPROCESS_READER_TIMEOUT_MS";

/// Tunables for a [`Worker`](crate::Worker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of request loops (and so of concurrent pool calls).
    pub threads: usize,
    /// How often a blocked caller re-checks that the worker is alive.
    pub poll_interval: Duration,
    /// How long a property read waits for the reader channel before falling
    /// back to the request pool.
    pub reader_lock_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            poll_interval: Duration::from_secs(2),
            reader_lock_timeout: Duration::from_millis(100),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn reader_lock_timeout(mut self, timeout: Duration) -> Self {
        self.reader_lock_timeout = timeout;
        self
    }

    /// Apply `IPROCESS_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; unparseable values are ignored with a
    /// warning.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(threads) = parse(&lookup, THREADS_ENV) {
            self.threads = threads;
        }
        if let Some(ms) = parse(&lookup, POLL_INTERVAL_ENV) {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, READER_TIMEOUT_ENV) {
            self.reader_lock_timeout = Duration::from_millis(ms);
        }
        self
    }

    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(IprocError::Config("threads must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(IprocError::Config("poll interval must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr, F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring invalid configuration override");
            None
        }
    }
}
