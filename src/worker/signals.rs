//! Termination analysis for the worker process.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// Reason why the worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Gone, but the status could not be collected.
    Unknown,
}

impl TerminationReason {
    /// Exit code in the usual convention: the status for a normal exit, the
    /// negated signal number for a signal death.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(signal) => Some(-(*signal as i32)),
            Self::Unknown => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal:?}"),
            Self::Unknown => write!(f, "terminated for an unknown reason"),
        }
    }
}

/// Analyze a `WaitStatus`; `None` while the process is still running.
pub fn analyze_wait_status(status: WaitStatus) -> Option<TerminationReason> {
    match status {
        WaitStatus::Exited(_, code) => Some(TerminationReason::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(TerminationReason::Signaled(signal)),
        WaitStatus::StillAlive => None,
        // Stopped/continued/traced: the process still exists.
        _ => None,
    }
}
