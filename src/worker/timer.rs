//! Periodic maintenance loops.
//!
//! Each periodic operation runs on its own thread inside the worker: sleep,
//! invoke, and adopt a positive return value (in seconds) as the next
//! interval. A failing or panicking task is logged and retried on the next
//! cycle; it never stops the loop.

use super::dispatch::panic_message;
use super::registry::OpError;
use super::spawn::spawn_named_thread;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

type Tick<S> = Arc<dyn Fn(&S) -> Result<Option<f64>, OpError> + Send + Sync>;

/// Interval to use after a cycle that returned `outcome`.
pub fn next_interval(current: Duration, outcome: Option<f64>) -> Duration {
    match outcome {
        Some(seconds) if seconds.is_finite() && seconds > 0.0 => {
            Duration::try_from_secs_f64(seconds).unwrap_or(current)
        }
        _ => current,
    }
}

/// One periodic task bound to the worker-side object.
pub struct TimerLoop<S> {
    name: String,
    interval: Duration,
    tick: Tick<S>,
    service: Arc<S>,
}

impl<S: Send + Sync + 'static> TimerLoop<S> {
    pub fn new(name: impl Into<String>, interval: Duration, tick: Tick<S>, service: Arc<S>) -> Self {
        Self {
            name: name.into(),
            interval,
            tick,
            service,
        }
    }

    /// Current interval.
    #[cfg(test)]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Invoke the task once and update the interval from its result.
    pub fn tick(&mut self) {
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.tick)(&*self.service)));
        match outcome {
            Ok(Ok(returned)) => self.interval = next_interval(self.interval, returned),
            Ok(Err(e)) => error!(timer = %self.name, error = ?e, "Periodic task failed"),
            Err(payload) => error!(
                timer = %self.name,
                panic = %panic_message(payload.as_ref()),
                "Periodic task panicked"
            ),
        }
    }

    /// Sleep/tick until `shutdown` is set.
    pub fn run(mut self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            debug!(timer = %self.name, wait_secs = self.interval.as_secs_f64(), "Next timer wait");
            thread::sleep(self.interval);
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.tick();
        }
    }

    /// Run the loop on a thread named `timer.<name>`.
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
        let thread_name = format!("timer.{}", self.name);
        spawn_named_thread(&thread_name, move || self.run(&shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Sweeper {
        runs: AtomicUsize,
    }

    fn tick_fn<F>(f: F) -> Tick<Sweeper>
    where
        F: Fn(&Sweeper) -> Result<Option<f64>, OpError> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn timer<F>(f: F) -> TimerLoop<Sweeper>
    where
        F: Fn(&Sweeper) -> Result<Option<f64>, OpError> + Send + Sync + 'static,
    {
        TimerLoop::new("sweep", Duration::from_secs(10), tick_fn(f), Arc::new(Sweeper::default()))
    }

    #[test]
    fn test_next_interval() {
        let current = Duration::from_secs(10);
        assert_eq!(next_interval(current, Some(2.5)), Duration::from_millis(2500));
        assert_eq!(next_interval(current, None), current);
        assert_eq!(next_interval(current, Some(0.0)), current);
        assert_eq!(next_interval(current, Some(-3.0)), current);
        assert_eq!(next_interval(current, Some(f64::NAN)), current);
        assert_eq!(next_interval(current, Some(f64::INFINITY)), current);
    }

    #[test]
    fn test_positive_return_changes_interval() {
        let mut timer = timer(|_| Ok(Some(0.5)));
        timer.tick();
        assert_eq!(timer.interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_none_keeps_interval() {
        let mut timer = timer(|_| Ok(None));
        timer.tick();
        assert_eq!(timer.interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_failure_and_panic_keep_interval() {
        let mut failing = timer(|_| Err(anyhow::anyhow!("disk full").into()));
        failing.tick();
        assert_eq!(failing.interval(), Duration::from_secs(10));

        let mut panicking = timer(|_| panic!("sweep exploded"));
        panicking.tick();
        assert_eq!(panicking.interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_loop_survives_failures() {
        let service = Arc::new(Sweeper::default());
        let tick = tick_fn(|s| {
            let run = s.runs.fetch_add(1, Ordering::SeqCst);
            if run % 2 == 0 {
                Err(anyhow::anyhow!("odd failure").into())
            } else {
                Ok(Some(0.005))
            }
        });
        let timer = TimerLoop::new("flaky", Duration::from_millis(5), tick, Arc::clone(&service));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = timer.spawn(Arc::clone(&shutdown)).unwrap();

        thread::sleep(Duration::from_millis(200));
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        assert!(service.runs.load(Ordering::SeqCst) >= 4);
    }
}
