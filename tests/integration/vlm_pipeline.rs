#![allow(missing_docs)]

//! End-to-end: captures in, recall out, across the whole scheduler family.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mnemora::ai::{
    ActivitySummaryOutput, ActivityWindowRequest, AiUsage, AnswerSynthesisRequest, CallOptions,
    EmbeddingClient, EventDetailsRequest, SearchAnswer, SearchAnswerCitation, SearchPlanRequest,
    SearchQueryPlan, TextClient, ThreadAssignment, ThreadAssignmentOutput, ThreadAssignmentRequest,
    VlmClient, VlmNodeOutput, VlmOutput, VlmRequest,
};
use mnemora::capture::CaptureInput;
use mnemora::engine::AiClients;
use mnemora::error::Result;
use mnemora::phash::PHash;
use mnemora::sched::{OcrEngine, OcrEngineProvider};
use mnemora::types::{now_ms, EntityRef, Knowledge, SourceKey, TextRegion};
use mnemora::{Config, Engine};

struct ScriptedVlm;

impl VlmClient for ScriptedVlm {
    fn analyze_batch(
        &self,
        request: &VlmRequest,
        _opts: &CallOptions,
    ) -> Result<(VlmOutput, AiUsage)> {
        let nodes = request
            .images
            .iter()
            .map(|image| VlmNodeOutput {
                screenshot_index: image.index,
                title: format!("Editing main.rs ({})", image.screenshot_id),
                summary: "Chasing a borrow checker error in the capture engine".into(),
                app_context: Some("Visual Studio Code".into()),
                knowledge: Some(Knowledge {
                    content: "E0502: cannot borrow `buf` as mutable".into(),
                    language: Some("eng".into()),
                    text_region: Some(TextRegion {
                        left: 0,
                        top: 0,
                        width: 8,
                        height: 8,
                    }),
                    key_insights: vec!["borrow checker".into()],
                }),
                state_snapshot: None,
                ui_text_snippets: vec!["cargo build".into()],
                keywords: vec!["rust".into(), "borrow".into()],
                entities: vec![EntityRef {
                    name: "main.rs".into(),
                    kind: Some("file".into()),
                }],
                importance: 6.0,
                confidence: 8.0,
            })
            .collect();
        Ok((VlmOutput { nodes }, AiUsage::default()))
    }
}

struct ScriptedText;

impl TextClient for ScriptedText {
    fn assign_threads(
        &self,
        request: &ThreadAssignmentRequest,
        _opts: &CallOptions,
    ) -> Result<(ThreadAssignmentOutput, AiUsage)> {
        Ok((
            ThreadAssignmentOutput {
                assignments: request
                    .nodes
                    .iter()
                    .map(|(index, _, _, _)| ThreadAssignment {
                        node_index: *index,
                        thread_id: "thr_borrow_fix".into(),
                        reason: None,
                    })
                    .collect(),
                thread_updates: vec![],
                new_threads: vec![mnemora::ai::NewThreadOutput {
                    thread_id: "thr_borrow_fix".into(),
                    title: "Borrow checker fix".into(),
                    summary: "Fixing E0502 in the capture engine".into(),
                }],
            },
            AiUsage::default(),
        ))
    }

    fn summarize_activity(
        &self,
        request: &ActivityWindowRequest,
        _opts: &CallOptions,
    ) -> Result<(ActivitySummaryOutput, AiUsage)> {
        Ok((
            ActivitySummaryOutput {
                title: "Coding session".into(),
                summary: format!("{} nodes of editor work", request.nodes.len()),
                highlights: vec!["fixed the borrow".into()],
                events: vec![],
            },
            AiUsage::default(),
        ))
    }

    fn event_details(
        &self,
        _request: &EventDetailsRequest,
        _opts: &CallOptions,
    ) -> Result<(String, AiUsage)> {
        Ok(("details".into(), AiUsage::default()))
    }

    fn plan_search(
        &self,
        request: &SearchPlanRequest,
        _opts: &CallOptions,
    ) -> Result<(SearchQueryPlan, AiUsage)> {
        Ok((
            SearchQueryPlan {
                embedding_text: request.query.clone(),
                filters_patch: None,
                kind_hint: None,
                extracted_entities: vec![],
                keywords: vec![],
                confidence: 0.9,
            },
            AiUsage::default(),
        ))
    }

    fn synthesize_answer(
        &self,
        request: &AnswerSynthesisRequest,
        _opts: &CallOptions,
    ) -> Result<(SearchAnswer, AiUsage)> {
        Ok((
            SearchAnswer {
                answer_title: Some("Borrow checker".into()),
                answer: "You were fixing E0502 in main.rs".into(),
                bullets: vec![],
                citations: request
                    .nodes
                    .first()
                    .map(|node| SearchAnswerCitation {
                        node_id: Some(node.node_id),
                        screenshot_id: None,
                        quote: None,
                    })
                    .into_iter()
                    .collect(),
                confidence: 0.8,
            },
            AiUsage::default(),
        ))
    }
}

/// Deterministic toy embedding: character-histogram-ish projection.
struct HashEmbedding {
    dims: usize,
}

impl EmbeddingClient for HashEmbedding {
    fn embed(
        &self,
        text: &str,
        dimensions: usize,
        _opts: &CallOptions,
    ) -> Result<(Vec<f32>, AiUsage)> {
        assert_eq!(dimensions, self.dims);
        let mut out = vec![0.0f32; dimensions];
        for (i, byte) in text.bytes().enumerate() {
            out[i % dimensions] += f32::from(byte) / 255.0;
        }
        Ok((out, AiUsage::default()))
    }
}

struct FixedOcr;

impl OcrEngine for FixedOcr {
    fn recognize(&mut self, _image: &image::GrayImage) -> Result<String> {
        Ok("error[E0502]: cannot borrow `buf` as mutable".into())
    }
}

struct FixedOcrProvider;

impl OcrEngineProvider for FixedOcrProvider {
    fn create_engine(&self, _languages: &str) -> Result<Box<dyn OcrEngine>> {
        Ok(Box::new(FixedOcr))
    }
}

fn png_bytes(seed: u8, path: &std::path::Path) -> Vec<u8> {
    let img = image::GrayImage::from_fn(16, 16, |x, y| {
        image::Luma([seed.wrapping_add((x * 7 + y * 13) as u8)])
    });
    img.save(path).unwrap();
    std::fs::read(path).unwrap()
}

fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) {
    let end = Instant::now() + deadline;
    while !probe() {
        assert!(Instant::now() < end, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn captures_flow_through_analysis_into_recall() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = Some(dir.path().to_path_buf());
    config.scheduler.min_delay_ms = 10;
    config.scheduler.default_interval_ms = 50;
    config.embedding.dimensions = 8;
    config.retention.enabled = false;

    let engine = Engine::bootstrap_with(
        config,
        AiClients {
            vlm: Some(Arc::new(ScriptedVlm)),
            text: Some(Arc::new(ScriptedText)),
            embedding: Some(Arc::new(HashEmbedding { dims: 8 })),
        },
        Some(Arc::new(FixedOcrProvider)),
        None,
    )
    .unwrap();

    let key = SourceKey::screen("1");
    engine.apply_preferences(
        &mnemora::capture::CapturePreferences::default(),
        &["1".to_string()],
    );

    // Two perceptually distant captures: the buffer reaches min size and
    // drains immediately.
    let now = now_ms();
    let path_a = dir.path().join("a.png");
    let path_b = dir.path().join("b.png");
    let bytes_a = png_bytes(0, &path_a);
    let bytes_b = png_bytes(128, &path_b);
    engine
        .capture_complete(vec![
            CaptureInput {
                source_key: key.clone(),
                ts: now - 2_000,
                buffer: bytes_a,
                file_path: path_a.to_string_lossy().into_owned(),
                app_hint: Some("Visual Studio Code".into()),
                window_title: Some("main.rs".into()),
                width: Some(16),
                height: Some(16),
                phash: Some(PHash::from_bits(0)),
                retention_expires_at: None,
            },
            CaptureInput {
                source_key: key.clone(),
                ts: now - 1_000,
                buffer: bytes_b,
                file_path: path_b.to_string_lossy().into_owned(),
                app_hint: Some("Visual Studio Code".into()),
                window_title: Some("main.rs".into()),
                width: Some(16),
                height: Some(16),
                phash: Some(PHash::from_bits(u64::MAX)),
                retention_expires_at: None,
            },
        ])
        .unwrap();

    let store = Arc::clone(engine.store());

    // Analysis: exactly one context node per screenshot.
    wait_until(Duration::from_secs(15), || {
        store.count_nodes().unwrap() == 2
    });

    // Threading: both nodes join the scripted thread.
    wait_until(Duration::from_secs(15), || {
        engine.get_thread("thr_borrow_fix").map_or(0, |n| n.len()) == 2
    });

    // Embedding and indexing: both vectors live in the index.
    wait_until(Duration::from_secs(15), || {
        engine.stats().map_or(0, |s| s.vector_index.live_vectors) == 2
    });

    // OCR: recognized text reaches the FTS index.
    wait_until(Duration::from_secs(15), || {
        store.fts_search("E0502", 10).map_or(0, |hits| hits.len()) == 2
    });

    // Recall: hybrid search finds the work, synthesis cites a node.
    let result = engine.search("borrow checker error", None).unwrap();
    assert!(!result.nodes.is_empty());
    assert!(!result.evidence.is_empty());
    let answer = result.answer.expect("synthesis ran");
    assert!(!answer.citations.is_empty());
    assert!(answer.confidence > 0.2);
    let plan = result.query_plan.expect("planning ran");
    assert!((plan.confidence - 0.9).abs() < 1e-9);

    // Thread recall through the RPC operation.
    let thread_nodes = engine.get_thread("thr_borrow_fix").unwrap();
    assert_eq!(thread_nodes.len(), 2);
    assert!(thread_nodes
        .windows(2)
        .all(|pair| pair[0].event_time <= pair[1].event_time));

    // Evidence for the thread's nodes maps back to both screenshots.
    let ids: Vec<i64> = thread_nodes.iter().map(|node| node.id).collect();
    let evidence = engine.get_evidence(&ids).unwrap();
    assert_eq!(evidence.len(), 2);
    assert!(evidence[0].ts >= evidence[1].ts);

    engine.shutdown();
}
