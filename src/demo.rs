//! A small calculator service used by the `iprocess demo` command, the
//! benchmarks and the integration tests.

use crate::worker::{OpError, Registry, Service, Worker};
use anyhow::bail;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// How often the `sweep` task runs until it adjusts itself.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Adds numbers, counts calls and sweeps in the background.
///
/// The main routine runs until `stop` is called or `lifetime` elapses, and
/// then fails when `fail` is set.
#[derive(Debug)]
pub struct Calculator {
    calls: AtomicU64,
    sweeps: AtomicU64,
    stop: AtomicBool,
    lifetime: Duration,
    fail: bool,
}

impl Calculator {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            calls: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            lifetime,
            fail: false,
        }
    }

    /// Make the main routine fail when it ends.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn sweep(&self) -> Option<f64> {
        let sweeps = self.sweeps.fetch_add(1, Ordering::SeqCst) + 1;
        // Back off once things are quiet.
        (sweeps >= 10).then_some(0.2)
    }
}

impl Service for Calculator {
    fn register(registry: &mut Registry<Self>) {
        registry
            .callable("add", &["a", "b"], |calc: &Calculator, args| {
                let a: i64 = args.arg(0, "a")?;
                let b: i64 = args.arg(1, "b")?;
                calc.calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OpError>(a + b)
            })
            .callable("divide", &["a", "b"], |calc: &Calculator, args| {
                let a: f64 = args.arg(0, "a")?;
                let b: f64 = args.arg(1, "b")?;
                calc.calls.fetch_add(1, Ordering::SeqCst);
                if b == 0.0 {
                    return Err(anyhow::anyhow!("division by zero").into());
                }
                Ok(a / b)
            })
            .callable("sleep", &["millis"], |calc: &Calculator, args| {
                let millis: u64 = args.arg(0, "millis")?;
                thread::sleep(Duration::from_millis(millis));
                calc.calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OpError>(millis)
            })
            .callable("stop", &[], |calc: &Calculator, _args| {
                calc.stop.store(true, Ordering::SeqCst);
                Ok::<_, OpError>(())
            })
            .property("count", |calc: &Calculator| calc.calls())
            .property("sweeps", |calc: &Calculator| calc.sweeps.load(Ordering::SeqCst))
            .periodic("sweep", SWEEP_INTERVAL, |calc: &Calculator| Ok(calc.sweep()));
    }

    fn run(&self, worker: &Worker<Self>) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.lifetime;
        while !self.stop.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if self.fail {
            let count = worker.property("count")?;
            bail!("boom: main routine failed after {count} calls");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::worker::Status;
    use serde_json::json;

    fn calculator() -> Worker<Calculator> {
        Worker::new(Calculator::new(Duration::from_secs(1)), WorkerConfig::default()).unwrap()
    }

    #[test]
    fn test_operations_registered() {
        let worker = calculator();
        let ops = worker.operations();
        let props: Vec<_> = ops.properties().collect();
        assert_eq!(props, vec!["count", "sweeps"]);
        let periodic: Vec<_> = ops.periodic().map(|(name, interval, _)| (name, interval)).collect();
        assert_eq!(periodic, vec![("sweep", SWEEP_INTERVAL)]);
    }

    #[test]
    fn test_sweep_backs_off() {
        let calc = Calculator::new(Duration::ZERO);
        for _ in 0..9 {
            assert_eq!(calc.sweep(), None);
        }
        assert_eq!(calc.sweep(), Some(0.2));
    }

    #[test]
    fn test_local_dispatch_before_start() {
        let worker = calculator();
        assert_eq!(worker.property("count").unwrap(), json!(0));
        // Not started: calls need a live worker.
        let err = worker.call("add", vec![json!(1), json!(2)]).unwrap_err();
        assert_eq!(err.status(), Some(Status::Unreachable));
    }
}
