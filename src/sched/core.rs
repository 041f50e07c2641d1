//! The shared scheduler loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::bus::{Event, EventBus, LifecyclePhase};
use crate::error::Result;
use crate::types::now_ms;

/// What one cycle accomplished, for logging and adaptive pacing.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOutcome {
    /// Items dispatched this cycle.
    pub worked: usize,
}

/// The work a concrete scheduler plugs into the shared loop.
pub trait SchedulerJob: Send + 'static {
    /// Stable scheduler name for lifecycle events and logs.
    fn name(&self) -> &'static str;

    /// Runs one full cycle: stale sweep, claim, dispatch.
    fn run_cycle(&self) -> Result<CycleOutcome>;

    /// The earliest future retry gate among claimable rows, used to pull
    /// the next cycle forward. `None` means nothing is scheduled.
    fn earliest_next_run(&self, now_ms: i64) -> Result<Option<i64>> {
        let _ = now_ms;
        Ok(None)
    }
}

impl<T: SchedulerJob + Sync> SchedulerJob for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn run_cycle(&self) -> Result<CycleOutcome> {
        (**self).run_cycle()
    }

    fn earliest_next_run(&self, now_ms: i64) -> Result<Option<i64>> {
        (**self).earliest_next_run(now_ms)
    }
}

/// Loop pacing parameters.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerTiming {
    /// Floor between cycles.
    pub min_delay_ms: u64,
    /// Ceiling between cycles; a cycle always runs at least this often.
    pub default_interval_ms: u64,
}

/// Handle controlling one spawned scheduler loop.
pub struct SchedulerHandle {
    name: &'static str,
    wake_tx: Sender<()>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// A cloneable wake endpoint, usable from bus subscribers after the handle
/// itself moved into the engine. The sender sits behind a mutex because
/// subscribers must be shareable across threads and `mpsc::Sender` is not.
#[derive(Clone)]
pub struct SchedulerWaker(Arc<parking_lot::Mutex<Sender<()>>>);

impl SchedulerWaker {
    /// Requests an early cycle.
    pub fn wake(&self) {
        let _ = self.0.lock().send(());
    }
}

impl SchedulerHandle {
    /// Requests an early cycle. Wakes arriving mid-cycle collapse into one
    /// immediate follow-up cycle.
    pub fn wake(&self) {
        match self.wake_tx.send(()) {
            Ok(()) | Err(_) => {}
        }
    }

    /// A cloneable wake endpoint for bus wiring.
    pub fn waker(&self) -> SchedulerWaker {
        SchedulerWaker(Arc::new(parking_lot::Mutex::new(self.wake_tx.clone())))
    }

    /// The scheduler's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stops the loop and joins the thread.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawns the loop thread for one scheduler.
pub fn spawn_scheduler(
    job: impl SchedulerJob,
    timing: SchedulerTiming,
    bus: Arc<EventBus>,
) -> SchedulerHandle {
    let (wake_tx, wake_rx) = mpsc::channel::<()>();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let name = job.name();

    let thread = thread::Builder::new()
        .name(format!("sched-{name}"))
        .spawn(move || run_loop(job, timing, bus, wake_rx, stop_flag))
        .expect("scheduler thread spawn");

    SchedulerHandle {
        name,
        wake_tx,
        stop,
        thread: Some(thread),
    }
}

fn run_loop(
    job: impl SchedulerJob,
    timing: SchedulerTiming,
    bus: Arc<EventBus>,
    wake_rx: Receiver<()>,
    stop: Arc<AtomicBool>,
) {
    let name = job.name();
    bus.publish(&Event::SchedulerLifecycle {
        scheduler: name,
        phase: LifecyclePhase::Started,
    });
    let min_delay = Duration::from_millis(timing.min_delay_ms);
    let mut delay = min_delay;
    let mut last_cycle_end: Option<std::time::Instant> = None;

    loop {
        match wake_rx.recv_timeout(delay) {
            Ok(()) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                bus.publish(&Event::SchedulerLifecycle {
                    scheduler: name,
                    phase: LifecyclePhase::Waked,
                });
                // A wake schedules a prompt cycle, but never closer than
                // the floor to the previous one; wakes landing inside the
                // floor coalesce.
                if let Some(end) = last_cycle_end {
                    let since = end.elapsed();
                    if since < min_delay {
                        thread::sleep(min_delay - since);
                    }
                }
                drain_pending(&wake_rx);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }

        bus.publish(&Event::SchedulerLifecycle {
            scheduler: name,
            phase: LifecyclePhase::CycleStart,
        });
        let outcome = job.run_cycle();
        bus.publish(&Event::SchedulerLifecycle {
            scheduler: name,
            phase: LifecyclePhase::CycleEnd,
        });
        match &outcome {
            Ok(outcome) => {
                if outcome.worked > 0 {
                    debug!(scheduler = name, worked = outcome.worked, "sched.cycle_end");
                }
            }
            Err(err) => warn!(scheduler = name, %err, "sched.cycle_failed"),
        }

        // Wakes that arrived during the cycle collapse into one prompt
        // follow-up; otherwise the next run lands at the earliest retry
        // gate, clamped between the floor and the default interval.
        last_cycle_end = Some(std::time::Instant::now());
        let woken_during_cycle = drain_pending(&wake_rx);
        delay = if woken_during_cycle {
            min_delay
        } else {
            compute_next_delay(&job, timing)
        };
    }

    bus.publish(&Event::SchedulerLifecycle {
        scheduler: name,
        phase: LifecyclePhase::Stopped,
    });
}

fn drain_pending(rx: &Receiver<()>) -> bool {
    let mut any = false;
    while rx.try_recv().is_ok() {
        any = true;
    }
    any
}

fn compute_next_delay(job: &impl SchedulerJob, timing: SchedulerTiming) -> Duration {
    let now = now_ms();
    let until_next = match job.earliest_next_run(now) {
        Ok(Some(next_run)) => next_run.saturating_sub(now).max(0) as u64,
        Ok(None) => timing.default_interval_ms,
        Err(err) => {
            warn!(scheduler = job.name(), %err, "sched.next_run_probe_failed");
            timing.default_interval_ms
        }
    };
    Duration::from_millis(until_next.clamp(timing.min_delay_ms, timing.default_interval_ms))
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct CountingJob {
        cycles: Arc<AtomicUsize>,
    }

    impl SchedulerJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn run_cycle(&self) -> Result<CycleOutcome> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            Ok(CycleOutcome { worked: 1 })
        }
    }

    #[test]
    fn wake_triggers_a_cycle_and_stop_joins() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let handle = spawn_scheduler(
            CountingJob {
                cycles: Arc::clone(&cycles),
            },
            SchedulerTiming {
                min_delay_ms: 10,
                default_interval_ms: 60_000,
            },
            Arc::new(EventBus::new()),
        );

        handle.wake();
        let deadline = Instant::now() + Duration::from_secs(5);
        while cycles.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "cycle did not run in time");
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
    }

    #[test]
    fn interval_fires_without_wakes() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let handle = spawn_scheduler(
            CountingJob {
                cycles: Arc::clone(&cycles),
            },
            SchedulerTiming {
                min_delay_ms: 5,
                default_interval_ms: 20,
            },
            Arc::new(EventBus::new()),
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        while cycles.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline, "cycles did not accumulate");
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
    }
}
