//! Worker process and thread spawning.
//!
//! The worker is a `fork(2)` of the current process: the worker-side object,
//! its operation table and every pipe are created before the fork, so the
//! child starts with its own copy of all of them and nothing has to be
//! serialized to bootstrap it.

use nix::unistd::{ForkResult, Pid};
use std::io;
use std::thread::{Builder, JoinHandle};

/// Which side of the fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// The original process; carries the worker's pid.
    Parent(Pid),
    /// The worker process.
    Child,
}

/// Fork the current process.
///
/// Only the calling thread exists in the child. The child must confine itself
/// to the state prepared for it before the fork and leave through [`exit`].
pub fn fork() -> io::Result<Forked> {
    // Safety: the child only touches state built before the fork (pipes,
    // the worker object, its operation table) and never returns into the
    // caller's code: it ends with `exit`, which skips the atexit handlers and
    // stdio buffers inherited from the parent.
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Parent { child }) => Ok(Forked::Parent(child)),
        Ok(ForkResult::Child) => Ok(Forked::Child),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}

/// Terminate the worker process immediately with `code`.
pub fn exit(code: i32) -> ! {
    // Safety: `_exit` is async-signal-safe and never returns.
    unsafe { nix::libc::_exit(code) }
}

/// Spawn a named thread.
///
/// Thread names show up in logs and debuggers (`request-0`, `reader`,
/// `timer.sweep`, `snapshot-collector`).
pub fn spawn_named_thread<F, T>(name: &str, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().name(name.to_string()).spawn(f)
}
