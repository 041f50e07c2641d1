#![allow(missing_docs)]

//! Queue-depth pressure mapping against a live store.

use std::sync::Arc;

use mnemora::capture::BackpressureController;
use mnemora::config::BackpressureConfig;
use mnemora::store::{NewScreenshot, Store, BATCH_VLM_MACHINE};
use mnemora::types::SourceKey;

fn store_with_unfinished_batches(count: usize) -> Arc<Store> {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let key = SourceKey::screen("1");
    for i in 0..count {
        let ts = 1_000 + i as i64;
        let sid = store
            .insert_screenshot(&NewScreenshot::for_test(key.clone(), ts), ts)
            .unwrap();
        store.create_and_persist_batch(&key, &[sid], ts).unwrap();
    }
    store
}

#[test]
fn queue_depth_maps_to_levels_and_analysis_drains_them() {
    let store = store_with_unfinished_batches(12);
    let ctrl = BackpressureController::new(BackpressureConfig::default(), 5_000);

    let depth = store.count_unfinished_batches().unwrap();
    assert_eq!(depth, 12);
    let update = ctrl.evaluate(depth, 0).unwrap();
    assert_eq!(update.label, "heavy");
    assert_eq!(update.capture_interval_ms, 20_000);
    assert_eq!(update.phash_threshold, 11);

    // Analysis finishes nine batches; depth falls into the normal band.
    for id in 1..=9 {
        assert!(store.try_claim(&BATCH_VLM_MACHINE, id, 2, 10).unwrap());
        store.complete(&BATCH_VLM_MACHINE, id, 20).unwrap();
    }
    let depth = store.count_unfinished_batches().unwrap();
    assert_eq!(depth, 3);

    // The first passing checks do not recover: hysteresis plus the
    // consecutive-check requirement gate the upgrade.
    assert!(ctrl.evaluate(depth, 1_000).is_none());
    assert!(ctrl.evaluate(depth, 6_000).is_none());
    assert!(ctrl.evaluate(depth, 11_000).is_none());
    assert_eq!(ctrl.current_level(), 3);

    // Once the window has elapsed with enough consecutive checks, the
    // controller steps down and restores the shipped defaults.
    let update = ctrl.evaluate(depth, 31_001).unwrap();
    assert_eq!(update.label, "normal");
    assert_eq!(update.capture_interval_ms, 5_000);
    assert_eq!(update.phash_threshold, 8);
}

#[test]
fn p9_no_upgrade_without_sustained_recovery() {
    let ctrl = BackpressureController::new(BackpressureConfig::default(), 5_000);
    ctrl.evaluate(20, 0).unwrap();
    assert_eq!(ctrl.current_level(), 3);

    // Single passing checks separated by relapses never upgrade, no matter
    // how much wall time passes.
    for round in 0..5i64 {
        let base = 100_000 * (round + 1);
        assert!(ctrl.evaluate(0, base).is_none());
        assert!(ctrl.evaluate(20, base + 5_000).is_none());
        assert_eq!(ctrl.current_level(), 3);
    }
}

#[test]
fn failed_batches_still_count_as_pressure() {
    let store = store_with_unfinished_batches(2);
    // One batch fails retryably: it still occupies the pipeline.
    assert!(store.try_claim(&BATCH_VLM_MACHINE, 1, 2, 10).unwrap());
    store.fail(&BATCH_VLM_MACHINE, 1, 2, 60_000, 20).unwrap();
    assert_eq!(store.count_unfinished_batches().unwrap(), 2);
}
