#![allow(missing_docs)]

use std::sync::Arc;

use parking_lot::Mutex;

use mnemora::bus::{BatchTrigger, Channel, Event, EventBus};
use mnemora::capture::{CaptureInput, RejectReason, SourceBufferRegistry};
use mnemora::phash::PHash;
use mnemora::store::{batch_content_id, Store};
use mnemora::types::{now_ms, SourceKey};

fn registry_over(
    store: Arc<Store>,
    bus: Arc<EventBus>,
    min_size: usize,
    timeout_ms: u64,
) -> SourceBufferRegistry {
    SourceBufferRegistry::new(
        bus,
        8,
        min_size,
        timeout_ms,
        60_000,
        Box::new(move |new| store.insert_screenshot(new, now_ms())),
    )
}

fn capture(key: &SourceKey, ts: i64, phash: u64) -> CaptureInput {
    CaptureInput {
        source_key: key.clone(),
        ts,
        buffer: Vec::new(),
        file_path: format!("/tmp/capture-{ts}.png"),
        app_hint: None,
        window_title: None,
        width: None,
        height: None,
        phash: Some(PHash::from_bits(phash)),
        retention_expires_at: None,
    }
}

#[test]
fn lone_screenshot_flushes_on_timeout_with_deterministic_batch_id() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new());

    let ready: Arc<Mutex<Vec<(SourceKey, Vec<i64>, BatchTrigger)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&ready);
    bus.subscribe(Channel::BatchReady, move |event| {
        if let Event::BatchReady {
            source_key,
            screenshot_ids,
            trigger,
        } = event
        {
            sink.lock()
                .push((source_key.clone(), screenshot_ids.clone(), *trigger));
        }
    });

    let registry = registry_over(Arc::clone(&store), Arc::clone(&bus), 2, 60_000);
    let key = SourceKey::screen("1");
    registry.set_active_sources(&[key.clone()], 0);

    let phash = PHash::from_hex(&"a".repeat(16)).unwrap();
    let mut input = capture(&key, 1_000, 0);
    input.phash = Some(phash);
    let outcome = registry.add(input, 1_000).unwrap();
    assert!(outcome.accepted);
    let screenshot_id = outcome.screenshot_id.unwrap();

    // Nothing fires before the timeout.
    registry.flush_idle(59_000);
    assert!(ready.lock().is_empty());

    // Sixty seconds with no further captures: a single-screenshot batch
    // with the timeout trigger.
    registry.flush_idle(61_001);
    let fired = ready.lock();
    assert_eq!(fired.len(), 1);
    let (source, ids, trigger) = &fired[0];
    assert_eq!(source, &key);
    assert_eq!(ids, &vec![screenshot_id]);
    assert_eq!(*trigger, BatchTrigger::Timeout);

    // The batch row's content id is a pure function of its members.
    let outcome = store
        .create_and_persist_batch(&key, ids, now_ms())
        .unwrap();
    let shot = store.get_screenshot(screenshot_id).unwrap().unwrap();
    let expected = batch_content_id(&key, shot.ts, shot.ts, ids);
    assert_eq!(outcome.batch.batch_id, expected);
}

#[test]
fn identical_phash_one_second_apart_is_rejected() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let registry = registry_over(Arc::clone(&store), bus, 5, 600_000);
    let key = SourceKey::screen("1");
    registry.set_active_sources(&[key.clone()], 0);

    let first = registry.add(capture(&key, 1_000, 0xabcd), 1_000).unwrap();
    assert!(first.accepted);
    let second = registry.add(capture(&key, 2_000, 0xabcd), 2_000).unwrap();
    assert!(!second.accepted);
    assert_eq!(second.reason, Some(RejectReason::Duplicate));
    assert_eq!(registry.buffer_len(&key), 1);
    // The rejected capture never reached the store.
    assert_eq!(store.count_screenshots().unwrap(), 1);
}

#[test]
fn accepted_sequence_respects_the_hamming_threshold() {
    // Every accepted pair of consecutive screenshots is farther apart than
    // the threshold.
    let store = Arc::new(Store::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let registry = registry_over(Arc::clone(&store), bus, 100, 600_000);
    let key = SourceKey::screen("1");
    registry.set_active_sources(&[key.clone()], 0);

    let threshold = 8u32;
    let hashes: Vec<u64> = vec![0, 1, 0x1ff, 0x1fe, 0x3ffff, u64::MAX];
    let mut accepted: Vec<PHash> = Vec::new();
    for (i, bits) in hashes.iter().enumerate() {
        let outcome = registry
            .add(capture(&key, 1_000 + i as i64, *bits), 1_000 + i as i64)
            .unwrap();
        if outcome.accepted {
            accepted.push(PHash::from_bits(*bits));
        }
    }
    for pair in accepted.windows(2) {
        assert!(
            pair[0].hamming(pair[1]) > threshold,
            "accepted neighbors too close: {} vs {}",
            pair[0],
            pair[1]
        );
    }
}
