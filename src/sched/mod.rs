//! The scheduler family.
//!
//! Five schedulers share one loop shape: a dedicated thread waits on a wake
//! channel with a timeout, sweeps stale `running` rows, claims work with CAS
//! updates, splits candidates into realtime/recovery lanes, and dispatches
//! up to the capability's concurrency. Retry policy and backoff live in the
//! store's state-machine helpers; this module owns the loop and the work.

mod activity;
mod core;
mod lanes;
mod ocr;
mod threads;
mod vector;
mod vlm;

pub use activity::ActivityScheduler;
pub use self::core::{
    spawn_scheduler, CycleOutcome, SchedulerHandle, SchedulerJob, SchedulerTiming, SchedulerWaker,
};
pub use lanes::{split_lanes, LaneConfig};
pub use ocr::{OcrEngine, OcrEngineProvider, OcrScheduler, OcrTask};
pub use threads::ThreadScheduler;
pub use vector::VectorDocumentScheduler;
pub use vlm::VlmScheduler;

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Runs `work` over `items` in dispatch order with at most `concurrency`
/// items in flight, blocking until all complete.
pub(crate) fn run_bounded<T: Send>(
    items: Vec<T>,
    concurrency: usize,
    work: impl Fn(T) + Sync,
) {
    if items.is_empty() {
        return;
    }
    let workers = concurrency.max(1).min(items.len());
    if workers == 1 {
        for item in items {
            work(item);
        }
        return;
    }
    let queue = Mutex::new(items.into_iter().collect::<VecDeque<T>>());
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let Some(item) = queue.lock().pop_front() else {
                    return;
                };
                work(item);
            });
        }
    });
}
