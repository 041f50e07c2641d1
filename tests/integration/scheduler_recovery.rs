#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use mnemora::ai::{
    AiRuntime, AiTelemetry, AiUsage, CallOptions, VlmClient, VlmNodeOutput, VlmOutput, VlmRequest,
};
use mnemora::bus::EventBus;
use mnemora::config::{AiRuntimeConfig, OcrConfig, SchedulerConfig, VlmConfig};
use mnemora::error::{MnemoraError, Result};
use mnemora::sched::{OcrScheduler, SchedulerJob, VlmScheduler};
use mnemora::store::{NewScreenshot, Store, BATCH_VLM_MACHINE};
use mnemora::types::{now_ms, SourceKey, VlmStatus};

/// A client that fails a configurable number of calls, then succeeds.
struct FlakyVlm {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl VlmClient for FlakyVlm {
    fn analyze_batch(
        &self,
        request: &VlmRequest,
        _opts: &CallOptions,
    ) -> Result<(VlmOutput, AiUsage)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
        {
            return Err(MnemoraError::AiTimeout(1));
        }
        let nodes = request
            .images
            .iter()
            .map(|image| VlmNodeOutput {
                screenshot_index: image.index,
                title: format!("analyzed {}", image.screenshot_id),
                summary: "recovered".into(),
                app_context: None,
                knowledge: None,
                state_snapshot: None,
                ui_text_snippets: vec![],
                keywords: vec![],
                entities: vec![],
                importance: 5.0,
                confidence: 5.0,
            })
            .collect();
        Ok((VlmOutput { nodes }, AiUsage::default()))
    }
}

struct Fixture {
    store: Arc<Store>,
    scheduler: VlmScheduler,
    batch_id: i64,
    _dir: tempfile::TempDir,
}

fn fixture(failures: usize, retry_delay_ms: u64, stale_threshold_ms: u64) -> Fixture {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let runtime = Arc::new(AiRuntime::new(&AiRuntimeConfig::default()));
    let telemetry = Arc::new(AiTelemetry::new(16));
    let ocr = Arc::new(OcrScheduler::new(Arc::clone(&store), None, OcrConfig::default()).unwrap());

    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("shot.png");
    image::GrayImage::from_pixel(8, 8, image::Luma([128]))
        .save(&image_path)
        .unwrap();

    let key = SourceKey::screen("1");
    let mut shot = NewScreenshot::for_test(key.clone(), 1_000);
    shot.file_path = Some(image_path.to_string_lossy().into_owned());
    let sid = store.insert_screenshot(&shot, 1_000).unwrap();
    let batch = store.create_and_persist_batch(&key, &[sid], 1_500).unwrap();

    let mut sched_cfg = SchedulerConfig::default();
    sched_cfg.retry_delay_ms = retry_delay_ms;
    sched_cfg.stale_running_threshold_ms = stale_threshold_ms;

    let scheduler = VlmScheduler::new(
        Arc::clone(&store),
        bus,
        runtime,
        telemetry,
        Some(Arc::new(FlakyVlm {
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        })),
        ocr,
        sched_cfg,
        VlmConfig::default(),
        "eng".into(),
    );
    Fixture {
        store,
        scheduler,
        batch_id: batch.batch.id,
        _dir: dir,
    }
}

#[test]
fn transient_failure_backs_off_then_recovers() {
    let fx = fixture(1, 0, 300_000);

    // First cycle: the claim bumps attempts, the call fails, the row backs
    // off as failed with a future gate (zero delay here, so it is
    // immediately claimable again).
    fx.scheduler.run_cycle().unwrap();
    let batch = fx.store.get_batch(fx.batch_id).unwrap().unwrap();
    assert_eq!(batch.vlm_status, VlmStatus::Failed);
    assert_eq!(batch.vlm_attempts, 1);
    assert!(batch.vlm_next_run_at.is_some());

    // Second cycle: retry succeeds, one node per screenshot.
    fx.scheduler.run_cycle().unwrap();
    let batch = fx.store.get_batch(fx.batch_id).unwrap().unwrap();
    assert_eq!(batch.vlm_status, VlmStatus::Succeeded);
    assert_eq!(batch.vlm_attempts, 2);
    for sid in &batch.screenshot_ids {
        assert!(fx.store.node_by_screenshot(*sid).unwrap().is_some());
    }
}

#[test]
fn attempts_exhaust_into_failed_permanent() {
    let fx = fixture(usize::MAX, 0, 300_000);
    fx.scheduler.run_cycle().unwrap();
    fx.scheduler.run_cycle().unwrap();
    let batch = fx.store.get_batch(fx.batch_id).unwrap().unwrap();
    assert_eq!(batch.vlm_status, VlmStatus::FailedPermanent);
    assert_eq!(batch.vlm_attempts, 2);
    assert_eq!(batch.vlm_next_run_at, None);

    // Permanently failed rows are never claimed again.
    fx.scheduler.run_cycle().unwrap();
    let batch = fx.store.get_batch(fx.batch_id).unwrap().unwrap();
    assert_eq!(batch.vlm_attempts, 2);
}

#[test]
fn stale_running_rows_are_adopted_by_the_next_cycle() {
    // Simulate a crash: a row claimed long ago, never finished.
    let fx = fixture(0, 0, 0);
    assert!(fx
        .store
        .try_claim(&BATCH_VLM_MACHINE, fx.batch_id, 2, now_ms() - 10)
        .unwrap());
    let batch = fx.store.get_batch(fx.batch_id).unwrap().unwrap();
    assert_eq!(batch.vlm_status, VlmStatus::Running);

    std::thread::sleep(std::time::Duration::from_millis(5));
    // The sweep at cycle head returns it to pending; the same cycle then
    // claims and finishes it.
    fx.scheduler.run_cycle().unwrap();
    let batch = fx.store.get_batch(fx.batch_id).unwrap().unwrap();
    assert_eq!(batch.vlm_status, VlmStatus::Succeeded);
}

#[test]
fn claims_are_exclusive_under_racing_workers() {
    let fx = fixture(0, 0, 300_000);
    let store = Arc::clone(&fx.store);
    let batch_id = fx.batch_id;
    let winners = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(AtomicBool::new(false));

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let winners = Arc::clone(&winners);
            let start = Arc::clone(&start);
            scope.spawn(move || {
                while !start.load(Ordering::SeqCst) {
                    std::hint::spin_loop();
                }
                if store
                    .try_claim(&BATCH_VLM_MACHINE, batch_id, 2, now_ms())
                    .unwrap()
                {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        start.store(true, Ordering::SeqCst);
    });
    assert_eq!(winners.load(Ordering::SeqCst), 1);
}
