#![allow(missing_docs)]

use std::sync::Arc;

use parking_lot::Mutex;

use mnemora::bus::{BatchTrigger, Channel, Event, EventBus};
use mnemora::capture::BatchBuilder;
use mnemora::error::MnemoraError;
use mnemora::store::{NewScreenshot, Store};
use mnemora::types::{SourceKey, StorageState, VlmStatus};

fn seed(store: &Store, key: &SourceKey, ts: i64) -> i64 {
    store
        .insert_screenshot(&NewScreenshot::for_test(key.clone(), ts), ts)
        .unwrap()
}

#[test]
fn identical_content_submitted_twice_reuses_one_row() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let key = SourceKey::screen("1");
    let a = seed(&store, &key, 1_000);
    let b = seed(&store, &key, 2_000);

    let first = store
        .create_and_persist_batch(&key, &[a, b], 2_500)
        .unwrap();
    let second = store
        .create_and_persist_batch(&key, &[a, b], 9_999)
        .unwrap();

    assert!(!first.reused);
    assert!(second.reused);
    assert_eq!(first.batch.id, second.batch.id);
    assert_eq!(first.batch.batch_id, second.batch.batch_id);
    assert_eq!(store.count_batches().unwrap(), 1);
}

#[test]
fn screenshot_ownership_conflict_rolls_back_cleanly() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let key = SourceKey::screen("1");
    let s1 = seed(&store, &key, 1_000);
    let s2 = seed(&store, &key, 2_000);
    let s3 = seed(&store, &key, 3_000);
    let s4 = seed(&store, &key, 4_000);

    let b1 = store
        .create_and_persist_batch(&key, &[s1, s2, s3], 3_500)
        .unwrap();

    let err = store
        .create_and_persist_batch(&key, &[s2, s4], 4_500)
        .unwrap_err();
    assert!(matches!(err, MnemoraError::Conflict(_)));
    assert!(err.to_string().contains(&s2.to_string()));

    // B1 keeps its members; s4 stays unassigned; no second batch row.
    for id in [s1, s2, s3] {
        let shot = store.get_screenshot(id).unwrap().unwrap();
        assert_eq!(shot.batch_id, Some(b1.batch.id));
        assert_eq!(shot.storage_state, StorageState::Persisted);
    }
    let orphan = store.get_screenshot(s4).unwrap().unwrap();
    assert_eq!(orphan.batch_id, None);
    assert_eq!(orphan.storage_state, StorageState::Ephemeral);
    assert_eq!(store.count_batches().unwrap(), 1);
}

#[test]
fn ready_event_produces_a_pending_persisted_batch() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let persisted: Arc<Mutex<Vec<(i64, String, Vec<i64>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&persisted);
    bus.subscribe(Channel::BatchPersisted, move |event| {
        if let Event::BatchPersisted {
            batch_db_id,
            batch_id,
            screenshot_ids,
            ..
        } = event
        {
            sink.lock()
                .push((*batch_db_id, batch_id.clone(), screenshot_ids.clone()));
        }
    });
    Arc::new(BatchBuilder::new(Arc::clone(&store), Arc::clone(&bus))).attach();

    let key = SourceKey::window("9");
    let late = seed(&store, &key, 5_000);
    let early = seed(&store, &key, 4_000);
    bus.publish(&Event::BatchReady {
        source_key: key.clone(),
        screenshot_ids: vec![late, early],
        trigger: BatchTrigger::Size,
    });

    let seen = persisted.lock();
    assert_eq!(seen.len(), 1);
    let (db_id, content_id, members) = &seen[0];
    assert!(content_id.starts_with("batch_"));
    // Members are re-ordered by capture time inside the transaction.
    assert_eq!(members, &vec![early, late]);

    let batch = store.get_batch(*db_id).unwrap().unwrap();
    assert_eq!(batch.vlm_status, VlmStatus::Pending);
    assert_eq!(batch.ts_start, 4_000);
    assert_eq!(batch.ts_end, 5_000);
    assert!(batch.ts_start <= batch.ts_end);

    // Replay of the same ready event is idempotent.
    bus.publish(&Event::BatchReady {
        source_key: key,
        screenshot_ids: vec![early, late],
        trigger: BatchTrigger::Size,
    });
    assert_eq!(store.count_batches().unwrap(), 1);
}
