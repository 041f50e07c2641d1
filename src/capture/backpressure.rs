//! Adaptive backpressure controller.
//!
//! Maps the unfinished-batch count to a pressure level that retunes the
//! capture interval and the perceptual-hash threshold. Downgrades (more
//! pressure) apply immediately; upgrades (less pressure) require the
//! recovery condition to hold across consecutive checks and a hysteresis
//! window, so a briefly-drained queue does not flap the capture cadence.

use parking_lot::Mutex;
use tracing::info;

use crate::config::BackpressureConfig;

const LEVEL_LABELS: [&str; 4] = ["normal", "light", "medium", "heavy"];

/// New settings produced by a level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureUpdate {
    /// Index into the configured level table.
    pub level: usize,
    /// Human-readable level label.
    pub label: &'static str,
    /// Capture interval to apply.
    pub capture_interval_ms: u64,
    /// Perceptual-hash threshold to apply.
    pub phash_threshold: u32,
}

#[derive(Debug)]
struct ControllerState {
    current: usize,
    recovery_target_since: Option<i64>,
    recovery_ok_checks: u32,
}

/// Queue-depth-driven pressure governor.
pub struct BackpressureController {
    config: BackpressureConfig,
    base_interval_ms: u64,
    state: Mutex<ControllerState>,
}

impl BackpressureController {
    /// Creates a controller starting at the most permissive level.
    pub fn new(config: BackpressureConfig, base_interval_ms: u64) -> Self {
        Self {
            config,
            base_interval_ms,
            state: Mutex::new(ControllerState {
                current: 0,
                recovery_target_since: None,
                recovery_ok_checks: 0,
            }),
        }
    }

    /// The label of a level index.
    pub fn label(level: usize) -> &'static str {
        LEVEL_LABELS.get(level).copied().unwrap_or("overflow")
    }

    /// The current level index.
    pub fn current_level(&self) -> usize {
        self.state.lock().current
    }

    /// Evaluates one check. Returns settings only when the level changed.
    pub fn evaluate(&self, unfinished_batches: u64, now_ms: i64) -> Option<BackpressureUpdate> {
        let target = self.target_level(unfinished_batches);
        let mut state = self.state.lock();

        if target == state.current {
            state.recovery_target_since = None;
            state.recovery_ok_checks = 0;
            return None;
        }

        if target > state.current {
            // More pressure: apply immediately.
            state.recovery_target_since = None;
            state.recovery_ok_checks = 0;
            state.current = target;
            let update = self.settings_for(target);
            info!(
                level = update.label,
                pending = unfinished_batches,
                "backpressure.downgraded"
            );
            return Some(update);
        }

        // Less pressure: require the condition to hold.
        let since = *state.recovery_target_since.get_or_insert(now_ms);
        state.recovery_ok_checks += 1;
        let held_long_enough =
            now_ms.saturating_sub(since) >= self.config.recovery_hysteresis_ms as i64;
        let enough_checks = state.recovery_ok_checks >= self.config.recovery_batch_threshold;
        if held_long_enough && enough_checks {
            state.current = target;
            state.recovery_target_since = None;
            state.recovery_ok_checks = 0;
            let update = self.settings_for(target);
            info!(
                level = update.label,
                pending = unfinished_batches,
                "backpressure.recovered"
            );
            return Some(update);
        }
        None
    }

    fn target_level(&self, unfinished: u64) -> usize {
        for (i, level) in self.config.levels.iter().enumerate() {
            match level.max_pending {
                Some(max) if unfinished <= max => return i,
                None => return i,
                _ => {}
            }
        }
        self.config.levels.len().saturating_sub(1)
    }

    fn settings_for(&self, level: usize) -> BackpressureUpdate {
        let row = &self.config.levels[level];
        BackpressureUpdate {
            level,
            label: Self::label(level),
            capture_interval_ms: self.base_interval_ms * u64::from(row.interval_factor),
            phash_threshold: row.phash_threshold,
        }
    }
}
