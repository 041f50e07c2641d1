//! Per-capability concurrency governance.
//!
//! Every AI call first acquires a permit here. Capacity is a counting
//! semaphore whose limit the AIMD tuner adjusts from observed outcomes;
//! repeated hard failures open a breaker that fails acquisition fast so
//! schedulers back off instead of piling onto a dead endpoint.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use super::Capability;
use crate::config::AiRuntimeConfig;
use crate::error::{MnemoraError, Result};
use crate::types::now_ms;

#[derive(Debug)]
struct SemState {
    permits_out: usize,
}

#[derive(Debug)]
struct CapabilityState {
    sem: Mutex<SemState>,
    available: Condvar,
    tuner: Mutex<AimdTuner>,
    breaker: Mutex<Breaker>,
}

/// Concurrency governor shared by every AI caller.
pub struct AiRuntime {
    caps: [Arc<CapabilityState>; 3],
}

/// A held concurrency slot; released on drop.
#[derive(Debug)]
pub struct Permit {
    cap: Arc<CapabilityState>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut sem = self.cap.sem.lock();
        sem.permits_out = sem.permits_out.saturating_sub(1);
        drop(sem);
        self.cap.available.notify_one();
    }
}

impl AiRuntime {
    /// Builds the runtime from configuration.
    pub fn new(config: &AiRuntimeConfig) -> Self {
        let build = |max: usize| {
            Arc::new(CapabilityState {
                sem: Mutex::new(SemState { permits_out: 0 }),
                available: Condvar::new(),
                tuner: Mutex::new(AimdTuner::new(config, max)),
                breaker: Mutex::new(Breaker::new(
                    config.breaker_trip_threshold,
                    config.breaker_open_ms,
                )),
            })
        };
        Self {
            caps: [
                build(config.vlm_max_concurrency),
                build(config.text_max_concurrency),
                build(config.embedding_max_concurrency),
            ],
        }
    }

    /// Acquires a slot, blocking while the capability is saturated.
    ///
    /// Fails fast with [`MnemoraError::AiUnavailable`] while the breaker is
    /// open; callers treat that as a retryable failure.
    pub fn acquire(&self, capability: Capability) -> Result<Permit> {
        let cap = &self.caps[capability.index()];
        if cap.breaker.lock().is_open(now_ms()) {
            return Err(MnemoraError::AiUnavailable(format!(
                "{} breaker open",
                capability.as_str()
            )));
        }
        let mut sem = cap.sem.lock();
        loop {
            let limit = cap.tuner.lock().limit();
            if sem.permits_out < limit {
                sem.permits_out += 1;
                return Ok(Permit {
                    cap: Arc::clone(cap),
                });
            }
            cap.available.wait(&mut sem);
        }
    }

    /// Records a successful call.
    pub fn record_success(&self, capability: Capability) {
        let cap = &self.caps[capability.index()];
        cap.breaker.lock().on_success();
        if let Some(new_limit) = cap.tuner.lock().on_success(now_ms()) {
            info!(
                capability = capability.as_str(),
                limit = new_limit,
                "ai.runtime.limit_recovered"
            );
            // Freed headroom may unblock waiters.
            cap.available.notify_all();
        }
    }

    /// Records a failed call; `trip_breaker` marks hard endpoint failures.
    pub fn record_failure(&self, capability: Capability, trip_breaker: bool) {
        let cap = &self.caps[capability.index()];
        if trip_breaker && cap.breaker.lock().on_hard_failure(now_ms()) {
            warn!(capability = capability.as_str(), "ai.runtime.breaker_opened");
        }
        if let Some(new_limit) = cap.tuner.lock().on_failure(now_ms()) {
            warn!(
                capability = capability.as_str(),
                limit = new_limit,
                "ai.runtime.limit_halved"
            );
        }
    }

    /// Current effective concurrency for a capability.
    pub fn limit(&self, capability: Capability) -> usize {
        self.caps[capability.index()].tuner.lock().limit()
    }

    /// Whether the capability's breaker is currently open.
    pub fn breaker_open(&self, capability: Capability) -> bool {
        self.caps[capability.index()]
            .breaker
            .lock()
            .is_open(now_ms())
    }
}

/// Additive-increase, multiplicative-decrease concurrency tuner.
#[derive(Debug)]
struct AimdTuner {
    limit: usize,
    min: usize,
    max: usize,
    window: VecDeque<bool>,
    window_size: usize,
    failure_rate: f64,
    consecutive_failure_trip: u32,
    consecutive_failures: u32,
    consecutive_successes: u32,
    success_run: u32,
    recovery_step: usize,
    cooldown_ms: u64,
    last_decrease_at: Option<i64>,
}

impl AimdTuner {
    fn new(config: &AiRuntimeConfig, max: usize) -> Self {
        Self {
            limit: max,
            min: config.adaptive_min_concurrency.max(1),
            max,
            window: VecDeque::with_capacity(config.aimd_window),
            window_size: config.aimd_window,
            failure_rate: config.aimd_failure_rate,
            consecutive_failure_trip: config.aimd_consecutive_failures,
            consecutive_failures: 0,
            consecutive_successes: 0,
            success_run: config.aimd_success_run,
            recovery_step: config.aimd_recovery_step,
            cooldown_ms: config.aimd_cooldown_ms,
            last_decrease_at: None,
        }
    }

    fn limit(&self) -> usize {
        self.limit
    }

    fn observe(&mut self, success: bool) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(success);
    }

    fn on_success(&mut self, now_ms: i64) -> Option<usize> {
        self.observe(true);
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;

        let cooled = self
            .last_decrease_at
            .map_or(true, |at| now_ms.saturating_sub(at) >= self.cooldown_ms as i64);
        if self.consecutive_successes >= self.success_run && cooled && self.limit < self.max {
            self.limit = (self.limit + self.recovery_step).min(self.max);
            self.consecutive_successes = 0;
            return Some(self.limit);
        }
        None
    }

    fn on_failure(&mut self, now_ms: i64) -> Option<usize> {
        self.observe(false);
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;

        let failures = self.window.iter().filter(|ok| !**ok).count();
        let rate_tripped = self.window.len() == self.window_size
            && (failures as f64 / self.window.len() as f64) > self.failure_rate;
        let run_tripped = self.consecutive_failures >= self.consecutive_failure_trip;
        if (rate_tripped || run_tripped) && self.limit > self.min {
            self.limit = (self.limit / 2).max(self.min);
            self.last_decrease_at = Some(now_ms);
            self.consecutive_failures = 0;
            self.window.clear();
            return Some(self.limit);
        }
        None
    }
}

/// Per-capability circuit breaker for hard endpoint failures.
#[derive(Debug)]
struct Breaker {
    consecutive_hard_failures: u32,
    trip_threshold: u32,
    open_until: Option<i64>,
    open_ms: u64,
}

impl Breaker {
    fn new(trip_threshold: u32, open_ms: u64) -> Self {
        Self {
            consecutive_hard_failures: 0,
            trip_threshold,
            open_until: None,
            open_ms,
        }
    }

    fn is_open(&mut self, now_ms: i64) -> bool {
        match self.open_until {
            Some(until) if now_ms < until => true,
            Some(_) => {
                // Half-open: allow probes; a success resets, another hard
                // failure re-opens immediately.
                self.open_until = None;
                self.consecutive_hard_failures = self.trip_threshold.saturating_sub(1);
                false
            }
            None => false,
        }
    }

    fn on_hard_failure(&mut self, now_ms: i64) -> bool {
        self.consecutive_hard_failures += 1;
        if self.consecutive_hard_failures >= self.trip_threshold && self.open_until.is_none() {
            self.open_until = Some(now_ms + self.open_ms as i64);
            return true;
        }
        false
    }

    fn on_success(&mut self) {
        self.consecutive_hard_failures = 0;
        self.open_until = None;
    }
}
