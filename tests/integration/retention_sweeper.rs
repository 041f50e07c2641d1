#![allow(missing_docs)]

//! Retention tombstoning through the engine.

use std::sync::Arc;

use mnemora::capture::CaptureInput;
use mnemora::phash::PHash;
use mnemora::types::{now_ms, SourceKey, StorageState};
use mnemora::{Config, Engine};

fn engine_in(dir: &std::path::Path) -> Arc<Engine> {
    let mut config = Config::default();
    config.data_dir = Some(dir.to_path_buf());
    config.scheduler.min_delay_ms = 10;
    config.scheduler.default_interval_ms = 50;
    config.retention.enabled = false; // swept explicitly below
    Engine::bootstrap(config).unwrap()
}

fn capture_with_retention(
    dir: &std::path::Path,
    name: &str,
    ts: i64,
    phash: u64,
    retention_expires_at: Option<i64>,
) -> CaptureInput {
    let path = dir.join(name);
    image::GrayImage::from_pixel(4, 4, image::Luma([phash as u8]))
        .save(&path)
        .unwrap();
    CaptureInput {
        source_key: SourceKey::screen("1"),
        ts,
        buffer: Vec::new(),
        file_path: path.to_string_lossy().into_owned(),
        app_hint: None,
        window_title: None,
        width: Some(4),
        height: Some(4),
        phash: Some(PHash::from_bits(phash)),
        retention_expires_at,
    }
}

#[test]
fn expired_screenshots_tombstone_and_release_their_files() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    engine.apply_preferences(
        &mnemora::capture::CapturePreferences::default(),
        &["1".to_string()],
    );

    let now = now_ms();
    engine
        .capture_complete(vec![
            capture_with_retention(dir.path(), "old.png", now - 10_000, 0, Some(now - 1_000)),
            capture_with_retention(dir.path(), "new.png", now - 5_000, u64::MAX, Some(now + 3_600_000)),
        ])
        .unwrap();

    let store = Arc::clone(engine.store());
    assert_eq!(store.count_screenshots().unwrap(), 2);
    let old_path = dir.path().join("old.png");
    let new_path = dir.path().join("new.png");
    assert!(old_path.exists());

    let report = engine.sweep_retention().unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.tombstoned, 1);

    // The expired file is unlinked, the fresh one survives.
    assert!(!old_path.exists());
    assert!(new_path.exists());

    // The tombstoned row survives with its file path nulled, and evidence
    // queries skip it.
    let expired = store.get_screenshot(1).unwrap().unwrap();
    assert_eq!(expired.storage_state, StorageState::Deleted);
    assert_eq!(expired.file_path, None);
    let evidence = store.evidence_for_screenshots(&[1, 2]).unwrap();
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0].screenshot_id, 2);

    // Sweeping again is a no-op.
    let report = engine.sweep_retention().unwrap();
    assert_eq!(report.tombstoned, 0);

    engine.shutdown();
}
