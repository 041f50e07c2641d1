//! Per-source capture buffering with perceptual dedup and batch triggering.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::bus::{BatchTrigger, Event, EventBus};
use crate::error::Result;
use crate::phash::PHash;
use crate::store::NewScreenshot;
use crate::types::{ScreenshotId, SourceKey};

/// One completed capture routed into the registry.
#[derive(Debug, Clone)]
pub struct CaptureInput {
    /// Capture source.
    pub source_key: SourceKey,
    /// Capture timestamp, epoch ms.
    pub ts: i64,
    /// Encoded image bytes; hashed when `phash` is not supplied.
    pub buffer: Vec<u8>,
    /// Where the driver wrote the image file.
    pub file_path: String,
    /// Best-effort owning application name.
    pub app_hint: Option<String>,
    /// Window title at capture time.
    pub window_title: Option<String>,
    /// Pixel width.
    pub width: Option<u32>,
    /// Pixel height.
    pub height: Option<u32>,
    /// Precomputed perceptual hash, when the driver supplies one.
    pub phash: Option<PHash>,
    /// Retention horizon for the stored row.
    pub retention_expires_at: Option<i64>,
}

/// Why an input was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The source is not in the active set.
    SourceInactive,
    /// Perceptually too close to the previously accepted capture.
    Duplicate,
    /// The image bytes could not be decoded for hashing.
    DecodeFailed,
}

impl RejectReason {
    /// Stable label for logs and callers.
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::SourceInactive => "source_inactive",
            RejectReason::Duplicate => "duplicate",
            RejectReason::DecodeFailed => "decode_failed",
        }
    }
}

/// Outcome of [`SourceBufferRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    /// Whether the capture entered a buffer.
    pub accepted: bool,
    /// Reject reason when not accepted.
    pub reason: Option<RejectReason>,
    /// Persisted row id when accepted.
    pub screenshot_id: Option<ScreenshotId>,
}

impl AddOutcome {
    fn rejected(reason: RejectReason) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            screenshot_id: None,
        }
    }
}

#[derive(Debug, Default)]
struct SourceBuffer {
    screenshots: Vec<BufferedShot>,
    last_phash: Option<PHash>,
    last_seen_at: i64,
    batch_start_ts: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
struct BufferedShot {
    id: ScreenshotId,
    ts: i64,
}

#[derive(Default)]
struct RegistryState {
    buffers: FxHashMap<SourceKey, SourceBuffer>,
    active: FxHashSet<SourceKey>,
    // Sources that left the active set, with the time they left.
    grace: FxHashMap<SourceKey, i64>,
    processing: bool,
    deferred_flush: bool,
}

/// Tunables the backpressure controller adjusts at runtime.
#[derive(Debug, Clone, Copy)]
struct Tuning {
    phash_threshold: u32,
    batch_min_size: usize,
    batch_timeout_ms: u64,
    source_grace_ms: u64,
}

/// Callback that persists an accepted capture and returns its row id.
pub type PersistFn = dyn Fn(&NewScreenshot) -> Result<ScreenshotId> + Send + Sync;

/// Per-source FIFO buffers of accepted captures.
///
/// Single-threaded with respect to one registry instance: calls are ordered
/// by the internal lock, and a drain in progress defers timeout flushes
/// rather than re-entering.
pub struct SourceBufferRegistry {
    state: Mutex<RegistryState>,
    tuning: Mutex<Tuning>,
    persist: Box<PersistFn>,
    bus: Arc<EventBus>,
}

impl SourceBufferRegistry {
    /// Creates a registry wired to the bus, persisting accepted captures
    /// through the injected callback.
    pub fn new(
        bus: Arc<EventBus>,
        phash_threshold: u32,
        batch_min_size: usize,
        batch_timeout_ms: u64,
        source_grace_ms: u64,
        persist: Box<PersistFn>,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            tuning: Mutex::new(Tuning {
                phash_threshold,
                batch_min_size,
                batch_timeout_ms,
                source_grace_ms,
            }),
            persist,
            bus,
        }
    }

    /// Replaces the active-source set.
    ///
    /// Buffers of sources that left the set survive for the grace period,
    /// then drop with their pending screenshots.
    pub fn set_active_sources(&self, keys: &[SourceKey], now_ms: i64) {
        let mut state = self.state.lock();
        let fresh: FxHashSet<SourceKey> = keys.iter().cloned().collect();
        let leaving: Vec<SourceKey> = state
            .active
            .iter()
            .filter(|key| !fresh.contains(*key))
            .cloned()
            .collect();
        for key in leaving {
            state.grace.entry(key).or_insert(now_ms);
        }
        for key in &fresh {
            state.grace.remove(key);
        }
        state.active = fresh;
        drop(state);
        self.expire_graced(now_ms);
    }

    /// Applies a retuned perceptual-hash threshold from backpressure.
    pub fn set_phash_threshold(&self, threshold: u32) {
        self.tuning.lock().phash_threshold = threshold;
    }

    /// Routes one completed capture.
    pub fn add(&self, input: CaptureInput, now_ms: i64) -> Result<AddOutcome> {
        let tuning = *self.tuning.lock();
        {
            let state = self.state.lock();
            if !state.active.contains(&input.source_key) {
                trace!(source_key = %input.source_key, "capture.add.rejected_inactive");
                return Ok(AddOutcome::rejected(RejectReason::SourceInactive));
            }
        }

        // Hash outside the lock; decoding is the expensive part.
        let phash = match input.phash {
            Some(hash) => hash,
            None => match PHash::compute(&input.buffer) {
                Ok(hash) => hash,
                Err(err) => {
                    debug!(source_key = %input.source_key, %err, "capture.add.decode_failed");
                    return Ok(AddOutcome::rejected(RejectReason::DecodeFailed));
                }
            },
        };

        {
            let mut state = self.state.lock();
            let buffer = state.buffers.entry(input.source_key.clone()).or_default();
            if phash.is_duplicate_of(buffer.last_phash, tuning.phash_threshold) {
                buffer.last_seen_at = now_ms;
                trace!(source_key = %input.source_key, "capture.add.rejected_duplicate");
                return Ok(AddOutcome::rejected(RejectReason::Duplicate));
            }
        }

        let new = NewScreenshot {
            source_key: input.source_key.clone(),
            ts: input.ts,
            phash,
            file_path: Some(input.file_path),
            app_hint: input.app_hint,
            window_title: input.window_title,
            width: input.width,
            height: input.height,
            retention_expires_at: input.retention_expires_at,
        };
        let screenshot_id = (self.persist)(&new)?;

        {
            let mut state = self.state.lock();
            let buffer = state.buffers.entry(input.source_key.clone()).or_default();
            buffer.screenshots.push(BufferedShot {
                id: screenshot_id,
                ts: input.ts,
            });
            buffer.last_phash = Some(phash);
            buffer.last_seen_at = now_ms;
            if buffer.batch_start_ts.is_none() {
                buffer.batch_start_ts = Some(now_ms);
            }
        }
        self.bus.publish(&Event::ScreenshotAccepted {
            screenshot_id,
            source_key: input.source_key.clone(),
        });

        self.process_ready_batches(now_ms);
        Ok(AddOutcome {
            accepted: true,
            reason: None,
            screenshot_id: Some(screenshot_id),
        })
    }

    /// Periodic tick: flushes idle buffers and expires graced sources.
    ///
    /// Runs at the batch-timeout cadence so a lone capture still batches
    /// even when no further captures arrive.
    pub fn flush_idle(&self, now_ms: i64) {
        self.expire_graced(now_ms);
        self.process_ready_batches(now_ms);
    }

    /// Buffered screenshot count for one source, for tests and stats.
    pub fn buffer_len(&self, source_key: &SourceKey) -> usize {
        self.state
            .lock()
            .buffers
            .get(source_key)
            .map(|b| b.screenshots.len())
            .unwrap_or(0)
    }

    fn expire_graced(&self, now_ms: i64) {
        let grace_ms = self.tuning.lock().source_grace_ms;
        let mut state = self.state.lock();
        let expired: Vec<SourceKey> = state
            .grace
            .iter()
            .filter(|(_, left_at)| now_ms.saturating_sub(**left_at) >= grace_ms as i64)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            state.grace.remove(&key);
            if let Some(buffer) = state.buffers.remove(&key) {
                if !buffer.screenshots.is_empty() {
                    debug!(
                        source_key = %key,
                        discarded = buffer.screenshots.len(),
                        "capture.registry.grace_expired"
                    );
                }
            }
        }
    }

    /// Drains every buffer satisfying the ready predicate, guarded against
    /// reentrancy: a timeout tick arriving mid-drain is deferred.
    fn process_ready_batches(&self, now_ms: i64) {
        {
            let mut state = self.state.lock();
            if state.processing {
                state.deferred_flush = true;
                return;
            }
            state.processing = true;
        }

        loop {
            let drained = self.drain_ready(now_ms);
            for (source_key, ids, trigger) in drained {
                self.bus.publish(&Event::BatchReady {
                    source_key,
                    screenshot_ids: ids,
                    trigger,
                });
            }

            let mut state = self.state.lock();
            if state.deferred_flush {
                state.deferred_flush = false;
                continue;
            }
            state.processing = false;
            break;
        }
    }

    fn drain_ready(&self, now_ms: i64) -> Vec<(SourceKey, Vec<ScreenshotId>, BatchTrigger)> {
        let tuning = *self.tuning.lock();
        let mut state = self.state.lock();
        let mut out = Vec::new();
        for (key, buffer) in state.buffers.iter_mut() {
            if buffer.screenshots.is_empty() {
                continue;
            }
            let by_size = buffer.screenshots.len() >= tuning.batch_min_size;
            let by_timeout = buffer
                .batch_start_ts
                .is_some_and(|start| now_ms.saturating_sub(start) >= tuning.batch_timeout_ms as i64);
            if !(by_size || by_timeout) {
                continue;
            }
            let trigger = if by_size {
                BatchTrigger::Size
            } else {
                BatchTrigger::Timeout
            };
            let mut shots = std::mem::take(&mut buffer.screenshots);
            shots.sort_by_key(|shot| shot.ts);
            buffer.batch_start_ts = None;
            debug!(
                source_key = %key,
                members = shots.len(),
                trigger = trigger.as_str(),
                "capture.registry.batch_ready"
            );
            out.push((
                key.clone(),
                shots.iter().map(|shot| shot.id).collect(),
                trigger,
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn test_registry(
        bus: Arc<EventBus>,
        min_size: usize,
        timeout_ms: u64,
    ) -> SourceBufferRegistry {
        let next_id = AtomicI64::new(1);
        SourceBufferRegistry::new(
            bus,
            8,
            min_size,
            timeout_ms,
            60_000,
            Box::new(move |_| Ok(next_id.fetch_add(1, Ordering::SeqCst))),
        )
    }

    fn input(key: &SourceKey, ts: i64, phash: u64) -> CaptureInput {
        CaptureInput {
            source_key: key.clone(),
            ts,
            buffer: Vec::new(),
            file_path: format!("/tmp/{ts}.png"),
            app_hint: None,
            window_title: None,
            width: None,
            height: None,
            phash: Some(PHash::from_bits(phash)),
            retention_expires_at: None,
        }
    }

    fn ready_batches(bus: &Arc<EventBus>) -> Arc<Mutex<Vec<(Vec<i64>, BatchTrigger)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(crate::bus::Channel::BatchReady, move |event| {
            if let Event::BatchReady {
                screenshot_ids,
                trigger,
                ..
            } = event
            {
                sink.lock().push((screenshot_ids.clone(), *trigger));
            }
        });
        seen
    }

    #[test]
    fn inactive_source_is_rejected() {
        let bus = Arc::new(EventBus::new());
        let registry = test_registry(Arc::clone(&bus), 2, 60_000);
        let key = SourceKey::screen("1");
        let outcome = registry.add(input(&key, 1_000, 1), 1_000).unwrap();
        assert_eq!(outcome, AddOutcome::rejected(RejectReason::SourceInactive));
    }

    #[test]
    fn duplicate_within_threshold_is_rejected_and_buffer_unchanged() {
        let bus = Arc::new(EventBus::new());
        let registry = test_registry(Arc::clone(&bus), 5, 60_000);
        let key = SourceKey::screen("1");
        registry.set_active_sources(&[key.clone()], 0);

        let first = registry.add(input(&key, 1_000, 0b1111), 1_000).unwrap();
        assert!(first.accepted);
        // Distance 1 <= threshold 8: duplicate.
        let second = registry.add(input(&key, 2_000, 0b1110), 2_000).unwrap();
        assert_eq!(second, AddOutcome::rejected(RejectReason::Duplicate));
        assert_eq!(registry.buffer_len(&key), 1);
    }

    #[test]
    fn min_size_drains_with_size_trigger() {
        let bus = Arc::new(EventBus::new());
        let seen = ready_batches(&bus);
        let registry = test_registry(Arc::clone(&bus), 2, 60_000);
        let key = SourceKey::screen("1");
        registry.set_active_sources(&[key.clone()], 0);

        registry.add(input(&key, 1_000, 0), 1_000).unwrap();
        assert!(seen.lock().is_empty());
        registry.add(input(&key, 2_000, u64::MAX), 2_000).unwrap();
        let batches = seen.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0.len(), 2);
        assert_eq!(batches[0].1, BatchTrigger::Size);
        assert_eq!(registry.buffer_len(&key), 0);
    }

    #[test]
    fn lone_capture_flushes_on_timeout() {
        let bus = Arc::new(EventBus::new());
        let seen = ready_batches(&bus);
        let registry = test_registry(Arc::clone(&bus), 2, 60_000);
        let key = SourceKey::screen("1");
        registry.set_active_sources(&[key.clone()], 0);

        registry.add(input(&key, 1_000, 0), 1_000).unwrap();
        registry.flush_idle(30_000);
        assert!(seen.lock().is_empty());
        registry.flush_idle(61_000);
        let batches = seen.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1, BatchTrigger::Timeout);
    }

    #[test]
    fn deselected_source_survives_grace_then_drops() {
        let bus = Arc::new(EventBus::new());
        let registry = test_registry(Arc::clone(&bus), 5, 600_000);
        let key = SourceKey::screen("1");
        registry.set_active_sources(&[key.clone()], 0);
        registry.add(input(&key, 1_000, 0), 1_000).unwrap();

        registry.set_active_sources(&[], 10_000);
        assert_eq!(registry.buffer_len(&key), 1);
        // New adds are rejected while deselected.
        let outcome = registry.add(input(&key, 11_000, u64::MAX), 11_000).unwrap();
        assert_eq!(outcome, AddOutcome::rejected(RejectReason::SourceInactive));

        registry.flush_idle(10_000 + 60_000);
        assert_eq!(registry.buffer_len(&key), 0);
    }

    #[test]
    fn raised_threshold_widens_dedup() {
        let bus = Arc::new(EventBus::new());
        let registry = test_registry(Arc::clone(&bus), 10, 600_000);
        let key = SourceKey::screen("1");
        registry.set_active_sources(&[key.clone()], 0);

        registry.add(input(&key, 1_000, 0), 1_000).unwrap();
        // Distance 10 > default threshold 8: accepted.
        let far = 0b11_1111_1111u64;
        assert!(registry.add(input(&key, 2_000, far), 2_000).unwrap().accepted);

        registry.set_phash_threshold(11);
        // Distance 10 <= 11 from the new last hash: duplicate now.
        assert_eq!(
            registry.add(input(&key, 3_000, 0), 3_000).unwrap(),
            AddOutcome::rejected(RejectReason::Duplicate)
        );
    }
}
