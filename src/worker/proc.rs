//! Process handle for the worker.
//!
//! Wraps the forked child's pid, reaps it without blocking, and remembers how
//! it terminated so every caller thread sees the same answer.

use super::liveness::Liveness;
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{IprocError, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Handle to the worker process.
#[derive(Debug)]
pub struct Proc {
    pid: Pid,
    /// Set once the process has been reaped.
    termination: Mutex<Option<TerminationReason>>,
}

impl Proc {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            termination: Mutex::new(None),
        }
    }

    /// How the process terminated, reaping it if it just exited.
    pub fn termination(&self) -> Option<TerminationReason> {
        let mut termination = self.termination.lock().unwrap_or_else(PoisonError::into_inner);
        if termination.is_none() {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => {
                    if let Some(reason) = analyze_wait_status(status) {
                        debug!(pid = self.pid.as_raw(), reason = %reason, "Worker process reaped");
                        *termination = Some(reason);
                    }
                }
                // Reaped elsewhere or not our child: it is gone either way.
                Err(Errno::ECHILD) => *termination = Some(TerminationReason::Unknown),
                Err(_) => {}
            }
        }
        *termination
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&self) -> bool {
        self.termination().is_none()
    }

    /// Wait up to `timeout` for the process to exit.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TerminationReason> {
        let start = Instant::now();
        loop {
            if let Some(reason) = self.termination() {
                return Some(reason);
            }
            if start.elapsed() >= timeout {
                return None;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)?;
        self.wait_timeout(Duration::from_secs(5));
        Ok(())
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        match signal::kill(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(IprocError::Sys(e)),
        }
    }
}

impl Liveness for Proc {
    fn is_alive(&self) -> bool {
        self.is_running()
    }

    fn exit_code(&self) -> Option<i32> {
        self.termination().and_then(|reason| reason.exit_code())
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.is_running() {
            // Try graceful termination
            let _ = self.terminate();
            if self.wait_timeout(Duration::from_millis(100)).is_some() {
                return;
            }
            let _ = self.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn spawn(program: &str, args: &[&str]) -> (std::process::Child, Proc) {
        let child = Command::new(program).args(args).spawn().expect("Failed to spawn");
        let proc = Proc::new(Pid::from_raw(child.id() as i32));
        (child, proc)
    }

    #[test]
    fn test_proc_reports_exit_code() {
        let (_child, proc) = spawn("sh", &["-c", "exit 3"]);
        let reason = proc.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reason, TerminationReason::Exited(3));
        assert!(!proc.is_alive());
        assert_eq!(proc.exit_code(), Some(3));
        // Cached after reaping.
        assert_eq!(proc.termination(), Some(TerminationReason::Exited(3)));
    }

    #[test]
    fn test_proc_terminate() {
        let (_child, proc) = spawn("sleep", &["60"]);
        assert!(proc.is_alive());
        assert_eq!(proc.exit_code(), None);

        proc.terminate().unwrap();
        let reason = proc.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGTERM));
        assert_eq!(proc.exit_code(), Some(-15));
    }

    #[test]
    fn test_signal_after_exit_is_noop() {
        let (_child, proc) = spawn("true", &[]);
        proc.wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(proc.terminate().is_ok());
        assert!(proc.kill().is_ok());
    }
}
