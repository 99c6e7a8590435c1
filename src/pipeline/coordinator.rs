// src/pipeline/coordinator.rs
//
// Drives one frame through the pipeline in a fixed order:
//
//   1. detect
//   2. tracker step (moves candidate boxes)
//   3. drift repair (every N frames)
//   4. lifecycle (ingest / single winner / miss expiry)
//   5. verification tick (spawns backend calls, never awaits them)
//   6. snapshot + phase reduction
//   7. navigation cue
//   8. emit to the cue sink
//
// No step can abort a frame: capability failures are logged and the frame
// degrades to whatever the store still supports.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::candidate::{Candidate, CandidateId, MatchStatus, RejectReason};
use crate::capabilities::{
    BoxTracker, CueSink, DepthProvider, Detector, Embedder, TextRecognizer, TrackUpdate,
    VerifierBackend,
};
use crate::config::PipelineConfig;
use crate::drift_repair::DriftRepair;
use crate::lifecycle::LifecycleManager;
use crate::pipeline::event_bus::{EventBus, PipelineEvent};
use crate::pipeline::frame_context::FrameContext;
use crate::pipeline::metrics::{MetricsSummary, PipelineMetrics};
use crate::pipeline::phase::{reduce_phase, Phase};
use crate::store::{CandidateStore, DuplicateThresholds};
use crate::types::{BBox, Frame};
use crate::verification::{TextConfirmation, VerificationEngine, VerifierBackends};

// ============================================================================
// OUTPUT TYPES
// ============================================================================

/// Where the host should guide the user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NavigationCue {
    pub candidate: CandidateId,
    pub bbox: BBox,
    /// Estimated distance from the depth provider, if any
    pub distance_m: Option<f32>,
    /// False when guiding towards a partial match
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateSummary {
    pub id: CandidateId,
    pub bbox: BBox,
    pub label: String,
    pub status: MatchStatus,
    pub miss_count: u32,
    pub reject_reason: Option<RejectReason>,
    pub description: Option<String>,
}

impl From<&Candidate> for CandidateSummary {
    fn from(c: &Candidate) -> Self {
        Self {
            id: c.id,
            bbox: c.bbox(),
            label: c.label.clone(),
            status: c.match_status,
            miss_count: c.miss_count,
            reject_reason: c.reject_reason,
            description: c.description.clone(),
        }
    }
}

/// Everything the host learns about one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameReport {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub phase: Phase,
    pub candidates: Vec<CandidateSummary>,
    pub cue: Option<NavigationCue>,
    /// A confirmed target dropped out this frame
    pub lost_target: bool,
}

// ============================================================================
// COORDINATOR
// ============================================================================

pub struct PipelineCoordinator {
    config: PipelineConfig,
    store: Arc<CandidateStore>,
    detector: Box<dyn Detector>,
    tracker: Box<dyn BoxTracker>,
    embedder: Arc<dyn Embedder>,
    depth: Option<Box<dyn DepthProvider>>,
    sink: Option<Box<dyn CueSink>>,
    lifecycle: LifecycleManager,
    drift: DriftRepair,
    engine: VerificationEngine,
    events: EventBus,
    metrics: PipelineMetrics,
    /// Candidates holding a tracker handle
    tracked: HashSet<CandidateId>,
    announced_target: Option<CandidateId>,
}

impl PipelineCoordinator {
    pub fn builder(config: PipelineConfig) -> PipelineCoordinatorBuilder {
        PipelineCoordinatorBuilder::new(config)
    }

    pub fn process_frame(&mut self, frame: Frame) -> FrameReport {
        let started = Instant::now();
        let frame_id = frame.frame_id;
        let timestamp_ms = frame.timestamp_ms;
        self.metrics.inc(&self.metrics.total_frames);
        self.store.advance_clock(timestamp_ms);

        // ── 1. Detect ──
        let mut ctx = match self.detector.detect(&frame, &self.config.target.class_filter) {
            Ok(detections) => FrameContext::new(frame, detections),
            Err(e) => {
                warn!("⚠️ Detector failed on frame {}: {:#}", frame_id, e);
                self.metrics.inc(&self.metrics.detector_failures);
                FrameContext::without_detections(frame)
            }
        };

        // ── 2. Tracker ──
        for update in self.tracker.tick(&ctx.frame) {
            match update {
                TrackUpdate::Moved { id, bbox } => {
                    if let Some(false) = self.store.update(id, |c| c.set_bbox(bbox)) {
                        debug!("Tracker produced a degenerate box for {}, kept previous", id);
                    }
                }
                TrackUpdate::Failed { id } => {
                    debug!("Tracker lost {} on frame {}", id, frame_id);
                }
            }
        }

        // ── 3. Drift repair ──
        if self.drift.is_due() {
            let corrections = self.drift.run(
                &mut ctx,
                &self.store,
                self.embedder.as_ref(),
                self.tracker.as_mut(),
            );
            self.metrics
                .add(&self.metrics.drift_repairs, corrections.len() as u64);
            for correction in &corrections {
                self.events.publish(PipelineEvent::drift(correction, frame_id));
            }
        }

        // ── 4. Lifecycle ──
        let lifecycle = self.lifecycle.tick(
            &mut ctx,
            &self.store,
            self.embedder.as_ref(),
            self.tracker.as_mut(),
        );
        for id in &lifecycle.created {
            self.tracked.insert(*id);
            self.metrics.inc(&self.metrics.candidates_created);
            self.events
                .publish(PipelineEvent::CandidateCreated { id: *id, frame_id });
        }
        if lifecycle.lost_target {
            self.metrics.inc(&self.metrics.targets_lost);
            self.events.publish(PipelineEvent::TargetLost { frame_id });
        }

        // ── 5. Verification ──
        self.engine.tick(&ctx.frame, &self.store);

        // ── 6. Snapshot + phase ──
        let snapshot = self.store.snapshot();
        self.release_departed(&snapshot, frame_id);

        let phase = if lifecycle.all_lost {
            Phase::Searching
        } else {
            reduce_phase(&snapshot)
        };
        self.announce(&phase, frame_id);

        // ── 7. Navigation cue ──
        let cue = self.navigation_cue(&phase, &snapshot);

        let report = FrameReport {
            frame_id,
            timestamp_ms,
            phase,
            candidates: snapshot.iter().map(CandidateSummary::from).collect(),
            cue,
            lost_target: lifecycle.lost_target,
        };

        // ── 8. Emit ──
        if let Some(sink) = self.sink.as_mut() {
            sink.emit(&report);
        }

        self.collect_verification_events();
        self.metrics.record_frame_time(started.elapsed());
        report
    }

    /// Stop tracking candidates that left the store, whoever removed them.
    fn release_departed(&mut self, snapshot: &[Candidate], frame_id: u64) {
        let present: HashSet<CandidateId> = snapshot.iter().map(|c| c.id).collect();
        let departed: Vec<CandidateId> = self
            .tracked
            .iter()
            .copied()
            .filter(|id| !present.contains(id))
            .collect();

        for id in departed {
            self.tracked.remove(&id);
            self.tracker.stop(id);
            self.engine.cancel(id);
            self.metrics.inc(&self.metrics.candidates_removed);
            self.events
                .publish(PipelineEvent::CandidateRemoved { id, frame_id });
        }
    }

    fn announce(&mut self, phase: &Phase, frame_id: u64) {
        match phase.found() {
            Some(id) if self.announced_target != Some(id) => {
                info!("🎯 Frame {}: target {} found", frame_id, id);
                self.announced_target = Some(id);
                self.engine.cancel_all_except(id);
                self.events
                    .publish(PipelineEvent::TargetFound { id, frame_id });
            }
            Some(_) => {}
            None => {
                if let Some(previous) = self.announced_target.take() {
                    debug!("Frame {}: target {} no longer confirmed", frame_id, previous);
                }
            }
        }
    }

    fn navigation_cue(&mut self, phase: &Phase, snapshot: &[Candidate]) -> Option<NavigationCue> {
        let (target, confirmed) = match phase {
            Phase::Found(id) => (snapshot.iter().find(|c| c.id == *id)?, true),
            _ if self.config.navigation.navigate_before_confirmation => {
                let partial = snapshot
                    .iter()
                    .filter(|c| c.match_status == MatchStatus::Partial)
                    .max_by(|a, b| a.last_updated_ms.total_cmp(&b.last_updated_ms))?;
                (partial, false)
            }
            _ => return None,
        };

        let bbox = target.bbox();
        let (cx, cy) = bbox.center();
        let distance_m = self.depth.as_mut().and_then(|d| d.depth_at(cx, cy));
        Some(NavigationCue {
            candidate: target.id,
            bbox,
            distance_m,
            confirmed,
        })
    }

    fn collect_verification_events(&mut self) {
        for event in self.engine.drain_events() {
            self.events.publish(event.into());
        }
    }

    /// Events published since the last call, verification results included.
    pub fn drain_events(&mut self) -> Vec<PipelineEvent> {
        self.collect_verification_events();
        self.events.drain()
    }

    /// Wait for all in-flight backend calls. Hosts call this at shutdown.
    pub async fn settle(&self) {
        self.engine.settle().await;
    }

    pub fn in_flight(&self) -> usize {
        self.engine.in_flight()
    }

    pub fn store(&self) -> &Arc<CandidateStore> {
        &self.store
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct PipelineCoordinatorBuilder {
    config: PipelineConfig,
    detector: Option<Box<dyn Detector>>,
    tracker: Option<Box<dyn BoxTracker>>,
    embedder: Option<Arc<dyn Embedder>>,
    primary: Option<Arc<dyn VerifierBackend>>,
    llm: Option<Arc<dyn VerifierBackend>>,
    text_recognizer: Option<Arc<dyn TextRecognizer>>,
    depth: Option<Box<dyn DepthProvider>>,
    sink: Option<Box<dyn CueSink>>,
    runtime: Option<Handle>,
    metrics: Option<PipelineMetrics>,
}

impl PipelineCoordinatorBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            detector: None,
            tracker: None,
            embedder: None,
            primary: None,
            llm: None,
            text_recognizer: None,
            depth: None,
            sink: None,
            runtime: None,
            metrics: None,
        }
    }

    pub fn detector(mut self, detector: impl Detector + 'static) -> Self {
        self.detector = Some(Box::new(detector));
        self
    }

    pub fn tracker(mut self, tracker: impl BoxTracker + 'static) -> Self {
        self.tracker = Some(Box::new(tracker));
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn primary_verifier(mut self, backend: Arc<dyn VerifierBackend>) -> Self {
        self.primary = Some(backend);
        self
    }

    pub fn llm_verifier(mut self, backend: Arc<dyn VerifierBackend>) -> Self {
        self.llm = Some(backend);
        self
    }

    /// Enables the text pass when the target also has `expected_text`.
    pub fn text_recognizer(mut self, recognizer: Arc<dyn TextRecognizer>) -> Self {
        self.text_recognizer = Some(recognizer);
        self
    }

    pub fn depth(mut self, depth: impl DepthProvider + 'static) -> Self {
        self.depth = Some(Box::new(depth));
        self
    }

    pub fn sink(mut self, sink: impl CueSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Runtime for backend calls. Defaults to the current tokio runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<PipelineCoordinator> {
        let detector = self.detector.ok_or_else(|| anyhow!("no detector configured"))?;
        let tracker = self.tracker.ok_or_else(|| anyhow!("no box tracker configured"))?;
        let embedder = self.embedder.ok_or_else(|| anyhow!("no embedder configured"))?;
        let primary = self
            .primary
            .ok_or_else(|| anyhow!("no primary verifier configured"))?;
        let llm = self.llm.ok_or_else(|| anyhow!("no LLM verifier configured"))?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().context("Coordinator needs a tokio runtime")?,
        };

        let config = self.config;
        let metrics = self.metrics.unwrap_or_default();

        let text = match (self.text_recognizer, config.target.expected_text.clone()) {
            (Some(recognizer), Some(expected)) => Some(TextConfirmation {
                recognizer,
                expected,
            }),
            (Some(_), None) => {
                warn!("Text recognizer supplied without expected text, text pass disabled");
                None
            }
            _ => None,
        };

        let store = Arc::new(CandidateStore::new(DuplicateThresholds {
            iou: config.verification.duplicate_iou,
            center_distance: config.verification.duplicate_center_distance,
        }));

        let engine = VerificationEngine::new(
            config.verification.clone(),
            config.target.description.clone(),
            VerifierBackends { primary, llm },
            text,
            runtime,
            metrics.clone(),
        );

        info!(
            "✓ Pipeline ready: target='{}', text pass={}, drift every {} frames",
            config.target.description,
            engine.text_pass_configured(),
            config.drift.interval_frames
        );

        Ok(PipelineCoordinator {
            lifecycle: LifecycleManager::new(config.verification.clone()),
            drift: DriftRepair::new(config.drift.clone()),
            events: EventBus::new(config.events.max_pending),
            store,
            detector,
            tracker,
            embedder,
            depth: self.depth,
            sink: self.sink,
            engine,
            metrics,
            tracked: HashSet::new(),
            announced_target: None,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::VerifierOutcome;
    use crate::types::{Detection, Embedding, ImageCrop};
    use async_trait::async_trait;
    use image::RgbImage;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Same boxes every frame; errors from frame `fail_from` onwards.
    struct FixedDetector {
        boxes: Vec<BBox>,
        fail_from: u64,
    }

    impl FixedDetector {
        fn steady(boxes: Vec<BBox>) -> Self {
            Self {
                boxes,
                fail_from: u64::MAX,
            }
        }
    }

    impl Detector for FixedDetector {
        fn detect(&mut self, frame: &Frame, _filter: &[String]) -> Result<Vec<Detection>> {
            if frame.frame_id >= self.fail_from {
                return Err(anyhow!("model not loaded"));
            }
            Ok(self
                .boxes
                .iter()
                .map(|b| Detection::new(*b, "car", 0.9))
                .collect())
        }
    }

    struct StillTracker;

    impl BoxTracker for StillTracker {
        fn start(&mut self, _id: CandidateId, _frame: &Frame, _bbox: BBox) {}
        fn reset(&mut self, _id: CandidateId, _frame: &Frame, _bbox: BBox) {}
        fn stop(&mut self, _id: CandidateId) {}
        fn tick(&mut self, _frame: &Frame) -> Vec<TrackUpdate> {
            Vec::new()
        }
    }

    /// Replays per-frame updates: `Some(bbox)` moves the n-th started
    /// handle, `None` reports it lost.
    #[derive(Default)]
    struct ScriptedTracker {
        handles: Vec<CandidateId>,
        plan: HashMap<u64, Vec<Option<BBox>>>,
        resets: Arc<Mutex<Vec<CandidateId>>>,
    }

    impl BoxTracker for ScriptedTracker {
        fn start(&mut self, id: CandidateId, _frame: &Frame, _bbox: BBox) {
            self.handles.push(id);
        }
        fn reset(&mut self, id: CandidateId, _frame: &Frame, _bbox: BBox) {
            if let Ok(mut resets) = self.resets.lock() {
                resets.push(id);
            }
        }
        fn stop(&mut self, id: CandidateId) {
            self.handles.retain(|h| *h != id);
        }
        fn tick(&mut self, frame: &Frame) -> Vec<TrackUpdate> {
            let Some(steps) = self.plan.get(&frame.frame_id) else {
                return Vec::new();
            };
            self.handles
                .iter()
                .zip(steps)
                .map(|(id, step)| match step {
                    Some(bbox) => TrackUpdate::Moved { id: *id, bbox: *bbox },
                    None => TrackUpdate::Failed { id: *id },
                })
                .collect()
        }
    }

    struct PositionEmbedder;

    impl Embedder for PositionEmbedder {
        fn embed(&self, crop: &ImageCrop) -> Result<Embedding> {
            Ok(Embedding(vec![crop.source.x + 0.1, crop.source.y + 0.1]))
        }
    }

    struct AlwaysMatch;

    #[async_trait]
    impl VerifierBackend for AlwaysMatch {
        async fn verify(&self, _crop: ImageCrop, _target: &str) -> Result<VerifierOutcome> {
            Ok(VerifierOutcome::matched("it"))
        }
    }

    struct FixedDepth(f32);

    impl DepthProvider for FixedDepth {
        fn depth_at(&mut self, _x: f32, _y: f32) -> Option<f32> {
            Some(self.0)
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<Phase>>>);

    impl CueSink for SharedSink {
        fn emit(&mut self, report: &FrameReport) {
            if let Ok(mut phases) = self.0.lock() {
                phases.push(report.phase.clone());
            }
        }
    }

    fn frame(id: u64) -> Frame {
        Frame::new(id, id as f64 * 33.0, RgbImage::new(64, 48))
    }

    fn coordinator(detector: FixedDetector, sink: SharedSink) -> PipelineCoordinator {
        coordinator_with_tracker(detector, StillTracker, sink)
    }

    fn coordinator_with_tracker(
        detector: FixedDetector,
        tracker: impl BoxTracker + 'static,
        sink: SharedSink,
    ) -> PipelineCoordinator {
        let backend: Arc<dyn VerifierBackend> = Arc::new(AlwaysMatch);
        PipelineCoordinator::builder(PipelineConfig::default())
            .detector(detector)
            .tracker(tracker)
            .embedder(Arc::new(PositionEmbedder))
            .primary_verifier(backend.clone())
            .llm_verifier(backend)
            .depth(FixedDepth(12.5))
            .sink(sink)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_capabilities() {
        let err = PipelineCoordinator::builder(PipelineConfig::default())
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("detector"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_searching_then_verifying_then_found() {
        let sink = SharedSink::default();
        let detector = FixedDetector::steady(vec![BBox::new(0.1, 0.1, 0.3, 0.3)]);
        let mut pipeline = coordinator(detector, sink.clone());

        let first = pipeline.process_frame(frame(0));
        assert!(matches!(first.phase, Phase::Verifying(ref ids) if ids.len() == 1));
        assert!(first.cue.is_none());

        pipeline.settle().await;
        let second = pipeline.process_frame(frame(1));
        let id = second.phase.found().unwrap();
        let cue = second.cue.unwrap();
        assert_eq!(cue.candidate, id);
        assert_eq!(cue.distance_m, Some(12.5));
        assert!(cue.confirmed);

        let events = pipeline.drain_events();
        assert!(events.contains(&PipelineEvent::TargetFound { id, frame_id: 1 }));
        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_failure_degrades_to_searching() {
        let sink = SharedSink::default();
        let detector = FixedDetector {
            boxes: Vec::new(),
            fail_from: 0,
        };
        let mut pipeline = coordinator(detector, sink);
        let report = pipeline.process_frame(frame(0));
        assert_eq!(report.phase, Phase::Searching);
        assert_eq!(pipeline.metrics().detector_failures, 1);
    }

    fn close_to(a: BBox, b: BBox) -> bool {
        a.iou(&b) > 0.99
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_updates_move_and_fail_handles() {
        let a = BBox::new(0.1, 0.1, 0.2, 0.2);
        let b = BBox::new(0.6, 0.5, 0.2, 0.2);
        let moved = BBox::new(0.15, 0.12, 0.2, 0.2);
        let mut plan = HashMap::new();
        plan.insert(1, vec![Some(moved), None]);
        plan.insert(2, vec![Some(BBox::new(0.3, 0.3, 0.0, 0.2)), None]);
        let tracker = ScriptedTracker {
            plan,
            ..Default::default()
        };
        let detector = FixedDetector::steady(vec![a, b]);
        let mut pipeline = coordinator_with_tracker(detector, tracker, SharedSink::default());

        let first = pipeline.process_frame(frame(0));
        let a_id = first.candidates[0].id;
        let b_id = first.candidates[1].id;

        pipeline.process_frame(frame(1));
        let store = pipeline.store();
        assert!(close_to(store.get(a_id).unwrap().bbox(), moved));
        // A lost track keeps its last box and the candidate
        assert!(close_to(store.get(b_id).unwrap().bbox(), b));
        assert_eq!(store.len(), 2);

        // Degenerate box from the tracker is refused
        pipeline.process_frame(frame(2));
        assert!(close_to(pipeline.store().get(a_id).unwrap().bbox(), moved));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_repair_runs_on_cadence() {
        let anchor = BBox::new(0.1, 0.1, 0.2, 0.2);
        let drifted = BBox::new(0.2, 0.1, 0.2, 0.2);
        let mut plan = HashMap::new();
        plan.insert(1, vec![Some(drifted)]);
        let resets = Arc::new(Mutex::new(Vec::new()));
        let tracker = ScriptedTracker {
            plan,
            resets: Arc::clone(&resets),
            ..Default::default()
        };
        let mut pipeline = coordinator_with_tracker(
            FixedDetector::steady(vec![anchor]),
            tracker,
            SharedSink::default(),
        );

        let id = pipeline.process_frame(frame(0)).candidates[0].id;
        for i in 1..14 {
            pipeline.process_frame(frame(i));
        }
        assert!(close_to(pipeline.store().get(id).unwrap().bbox(), drifted));
        assert_eq!(pipeline.metrics().drift_repairs, 0);

        // 15th frame: the drifted box snaps back onto the detection
        pipeline.process_frame(frame(14));
        assert!(close_to(pipeline.store().get(id).unwrap().bbox(), anchor));
        assert_eq!(pipeline.metrics().drift_repairs, 1);
        assert_eq!(resets.lock().unwrap().as_slice(), &[id]);
        let drift_events = pipeline
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, PipelineEvent::DriftRepaired { id: repaired, frame_id: 14, .. } if *repaired == id))
            .count();
        assert_eq!(drift_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_failures_do_not_expire_candidates() {
        let detector = FixedDetector {
            boxes: vec![BBox::new(0.1, 0.1, 0.2, 0.2)],
            fail_from: 1,
        };
        let mut pipeline = coordinator(detector, SharedSink::default());
        let id = pipeline.process_frame(frame(0)).candidates[0].id;

        let miss_threshold = PipelineConfig::default().verification.miss_threshold as u64;
        for i in 1..=miss_threshold + 3 {
            let report = pipeline.process_frame(frame(i));
            assert!(!report.lost_target);
            assert_ne!(report.phase, Phase::Searching);
        }

        let survivor = pipeline.store().get(id).unwrap();
        assert_eq!(survivor.miss_count, 0);
        assert_eq!(pipeline.metrics().detector_failures, miss_threshold + 3);
        assert!(!pipeline
            .drain_events()
            .iter()
            .any(|e| matches!(e, PipelineEvent::CandidateRemoved { .. })));
    }
}
