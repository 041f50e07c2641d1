//! OCR scheduler: a bounded worker pool over long-lived engine instances.
//!
//! Tasks arrive from the VLM scheduler whenever a node's payload locates a
//! text region in a supported language. Each worker owns one engine
//! initialized with the configured language pack; tasks pull from a FIFO
//! and acquire a worker through a wait queue.

use std::collections::VecDeque;
use std::sync::Arc;

use image::imageops;
use image::GrayImage;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::core::{CycleOutcome, SchedulerJob};
use super::run_bounded;
use crate::config::OcrConfig;
use crate::error::{MnemoraError, Result};
use crate::store::Store;
use crate::types::{now_ms, NodeId, ScreenshotId, TextRegion};

/// One OCR engine instance, created per worker with a language pack.
pub trait OcrEngine: Send {
    /// Recognizes text in a preprocessed greyscale image.
    fn recognize(&mut self, image: &GrayImage) -> Result<String>;
}

/// Creates engine instances; the engine library is an external collaborator.
pub trait OcrEngineProvider: Send + Sync {
    /// Initializes one engine with the given language pack.
    fn create_engine(&self, languages: &str) -> Result<Box<dyn OcrEngine>>;
}

/// A queued recognition task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OcrTask {
    /// The node whose record receives the text.
    pub node_id: NodeId,
    /// The screenshot to read pixels from.
    pub screenshot_id: ScreenshotId,
}

struct EnginePool {
    idle: Mutex<Vec<Box<dyn OcrEngine>>>,
    available: Condvar,
    size: usize,
}

impl EnginePool {
    fn acquire(&self) -> Box<dyn OcrEngine> {
        let mut idle = self.idle.lock();
        loop {
            if let Some(engine) = idle.pop() {
                return engine;
            }
            self.available.wait(&mut idle);
        }
    }

    fn release(&self, engine: Box<dyn OcrEngine>) {
        self.idle.lock().push(engine);
        self.available.notify_one();
    }
}

/// Scheduler draining the OCR task queue through the worker pool.
pub struct OcrScheduler {
    store: Arc<Store>,
    queue: Mutex<VecDeque<OcrTask>>,
    pool: Option<EnginePool>,
    config: OcrConfig,
}

impl OcrScheduler {
    /// Builds the scheduler, eagerly initializing one engine per worker.
    ///
    /// Without a provider the scheduler idles and enqueued tasks are
    /// dropped with a warning.
    pub fn new(
        store: Arc<Store>,
        provider: Option<Arc<dyn OcrEngineProvider>>,
        config: OcrConfig,
    ) -> Result<Self> {
        let pool = match provider {
            Some(provider) => {
                let mut engines = Vec::with_capacity(config.concurrency);
                for _ in 0..config.concurrency.max(1) {
                    engines.push(provider.create_engine(&config.languages)?);
                }
                let size = engines.len();
                Some(EnginePool {
                    idle: Mutex::new(engines),
                    available: Condvar::new(),
                    size,
                })
            }
            None => None,
        };
        Ok(Self {
            store,
            queue: Mutex::new(VecDeque::new()),
            pool,
            config,
        })
    }

    /// Appends a task to the FIFO.
    pub fn enqueue(&self, task: OcrTask) {
        if self.pool.is_none() {
            warn!(node = task.node_id, "sched.ocr.no_engine_drop");
            return;
        }
        self.queue.lock().push_back(task);
    }

    /// Queued task count, for stats.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    fn process_task(&self, task: OcrTask, pool: &EnginePool) -> Result<()> {
        let node = self
            .store
            .get_node(task.node_id)?
            .ok_or(MnemoraError::NotFound("context node"))?;
        let shot = self
            .store
            .get_screenshot(task.screenshot_id)?
            .ok_or(MnemoraError::NotFound("screenshot"))?;
        let path = shot
            .file_path
            .as_ref()
            .ok_or(MnemoraError::NotFound("screenshot file"))?;
        let decoded = image::open(path)
            .map_err(|err| MnemoraError::DecodeFailed(err.to_string()))?
            .to_luma8();

        let region = node
            .knowledge
            .as_ref()
            .and_then(|knowledge| knowledge.text_region);
        let prepared = preprocess(decoded, region);

        let mut engine = pool.acquire();
        let recognized = engine.recognize(&prepared);
        pool.release(engine);
        let text = recognized?;

        let trimmed = text.trim();
        let bounded: String = trimmed.chars().take(self.config.max_chars).collect();
        let now = now_ms();
        self.store.set_node_ocr_text(task.node_id, &bounded, now)?;
        let ui_text = node.ui_text_snippets.join("\n");
        self.store
            .upsert_fts_row(task.screenshot_id, &bounded, &ui_text)?;
        debug!(
            node = task.node_id,
            chars = bounded.chars().count(),
            "sched.ocr.recognized"
        );
        Ok(())
    }
}

/// Crop (clamped to bounds), min-max normalize, mild sharpen, and a linear
/// contrast stretch, in that order.
fn preprocess(image: GrayImage, region: Option<TextRegion>) -> GrayImage {
    let cropped = match region.and_then(|r| clamp_region(r, image.width(), image.height())) {
        Some(r) => imageops::crop_imm(&image, r.left, r.top, r.width, r.height).to_image(),
        None => image,
    };
    let normalized = normalize(&cropped);
    let sharpened = imageops::filter3x3(
        &normalized,
        &[0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0],
    );
    linear_contrast(&sharpened, 1.2, -20.0)
}

fn clamp_region(region: TextRegion, width: u32, height: u32) -> Option<TextRegion> {
    if width == 0 || height == 0 {
        return None;
    }
    let left = region.left.min(width.saturating_sub(1));
    let top = region.top.min(height.saturating_sub(1));
    let clamped = TextRegion {
        left,
        top,
        width: region.width.min(width - left).max(1),
        height: region.height.min(height - top).max(1),
    };
    Some(clamped)
}

fn normalize(image: &GrayImage) -> GrayImage {
    let (mut lo, mut hi) = (u8::MAX, u8::MIN);
    for pixel in image.pixels() {
        lo = lo.min(pixel.0[0]);
        hi = hi.max(pixel.0[0]);
    }
    if hi <= lo {
        return image.clone();
    }
    let range = f32::from(hi - lo);
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        let value = f32::from(pixel.0[0] - lo) / range * 255.0;
        pixel.0[0] = value.round().clamp(0.0, 255.0) as u8;
    }
    out
}

fn linear_contrast(image: &GrayImage, gain: f32, bias: f32) -> GrayImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        let value = f32::from(pixel.0[0]) * gain + bias;
        pixel.0[0] = value.round().clamp(0.0, 255.0) as u8;
    }
    out
}

impl SchedulerJob for OcrScheduler {
    fn name(&self) -> &'static str {
        "ocr"
    }

    fn run_cycle(&self) -> Result<CycleOutcome> {
        let Some(pool) = &self.pool else {
            self.queue.lock().clear();
            return Ok(CycleOutcome::default());
        };
        let tasks: Vec<OcrTask> = self.queue.lock().drain(..).collect();
        if tasks.is_empty() {
            return Ok(CycleOutcome::default());
        }
        let worked = tasks.len();
        run_bounded(tasks, pool.size, |task| {
            if let Err(err) = self.process_task(task, pool) {
                warn!(node = task.node_id, %err, "sched.ocr.task_failed");
            }
        });
        Ok(CycleOutcome { worked })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_clamp_to_image_bounds() {
        let region = TextRegion {
            left: 90,
            top: 90,
            width: 50,
            height: 50,
        };
        let clamped = clamp_region(region, 100, 100).unwrap();
        assert_eq!(clamped.left, 90);
        assert_eq!(clamped.width, 10);
        assert_eq!(clamped.height, 10);

        let oversized = TextRegion {
            left: 500,
            top: 0,
            width: 10,
            height: 10,
        };
        let clamped = clamp_region(oversized, 100, 100).unwrap();
        assert_eq!(clamped.left, 99);
        assert_eq!(clamped.width, 1);
    }

    #[test]
    fn normalize_stretches_to_full_range() {
        let mut img = GrayImage::new(2, 1);
        img.put_pixel(0, 0, image::Luma([100]));
        img.put_pixel(1, 0, image::Luma([150]));
        let out = normalize(&img);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
        assert_eq!(out.get_pixel(1, 0).0[0], 255);
    }

    #[test]
    fn flat_images_survive_normalization() {
        let img = GrayImage::from_pixel(4, 4, image::Luma([7]));
        let out = normalize(&img);
        assert_eq!(out.get_pixel(2, 2).0[0], 7);
    }

    #[test]
    fn linear_contrast_clamps() {
        let img = GrayImage::from_pixel(1, 1, image::Luma([250]));
        let out = linear_contrast(&img, 1.2, -20.0);
        assert_eq!(out.get_pixel(0, 0).0[0], 255);
        let dark = GrayImage::from_pixel(1, 1, image::Luma([10]));
        let out = linear_contrast(&dark, 1.2, -20.0);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
    }
}
