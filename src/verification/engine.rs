// src/verification/engine.rs
//
// Asynchronous match/no-match decisions for candidates.
//
// The frame loop calls `tick` once per frame. Eligible candidates are marked
// `Waiting` and a backend call is spawned on the runtime; the frame loop
// never awaits it. Each call is wrapped in a hard timeout and its result is
// folded back into the store whenever it lands, possibly several frames
// later. A candidate reaching `Full` aborts every other in-flight call.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::candidate::{Candidate, CandidateId, EngineKind, MatchStatus, RejectReason};
use crate::capabilities::{TextRecognizer, VerifierBackend, VerifierOutcome};
use crate::config::VerificationConfig;
use crate::pipeline::PipelineMetrics;
use crate::store::CandidateStore;
use crate::types::Frame;
use crate::verification::policy::EscalationPolicy;
use crate::verification::tasks::InFlightTasks;
use crate::verification::text_confirmation::{apply_text_reading, TextThresholds, TextVerdict};

// ============================================================================
// BACKENDS AND EVENTS
// ============================================================================

/// The two verifier implementations, selected per attempt by `EngineKind`.
#[derive(Clone)]
pub struct VerifierBackends {
    pub primary: Arc<dyn VerifierBackend>,
    pub llm: Arc<dyn VerifierBackend>,
}

impl VerifierBackends {
    pub fn get(&self, kind: EngineKind) -> Arc<dyn VerifierBackend> {
        match kind {
            EngineKind::Primary => Arc::clone(&self.primary),
            EngineKind::Llm => Arc::clone(&self.llm),
        }
    }
}

/// Secondary text pass: recognizer plus the text the target must carry.
#[derive(Clone)]
pub struct TextConfirmation {
    pub recognizer: Arc<dyn TextRecognizer>,
    pub expected: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptVerdict {
    Confirmed,
    /// Matched, waiting on the text pass
    Partial,
    Retry(RejectReason),
    Rejected(RejectReason),
    /// Confirmed target re-checked and kept
    Refreshed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerificationEvent {
    Completed {
        id: CandidateId,
        engine: EngineKind,
        verdict: AttemptVerdict,
        timed_out: bool,
    },
    TextChecked {
        id: CandidateId,
        verdict: TextVerdict,
        text: Option<String>,
    },
}

// ============================================================================
// OUTCOME INTERPRETATION
// ============================================================================

/// Fold one backend outcome into the candidate.
///
/// A non-match without a recognizable reason is treated as a hard reject.
pub fn apply_outcome(
    candidate: &mut Candidate,
    kind: EngineKind,
    outcome: &VerifierOutcome,
    now_ms: f64,
    text_configured: bool,
) -> AttemptVerdict {
    let reverify = candidate.is_full();

    candidate.stamp_call(kind, now_ms);
    if let Some(view) = outcome.view {
        candidate.observe_view(view, outcome.view_score.unwrap_or(0.0));
    }

    if outcome.is_match {
        candidate.counters.reset(kind);
        candidate.reject_reason = None;
        if !outcome.description.is_empty() {
            candidate.description = Some(outcome.description.clone());
        }
        if reverify {
            return AttemptVerdict::Refreshed;
        }
        candidate.touch(now_ms);
        if text_configured {
            candidate.match_status = MatchStatus::Partial;
            candidate.ocr_attempts = 0;
            AttemptVerdict::Partial
        } else {
            candidate.match_status = MatchStatus::Full;
            AttemptVerdict::Confirmed
        }
    } else {
        candidate.counters.record_failure(kind);
        let reason = outcome.reject_reason.unwrap_or(RejectReason::WrongAttributes);
        candidate.reject_reason = Some(reason);

        if reason.is_retryable() {
            if !reverify {
                candidate.match_status = MatchStatus::Unknown;
                candidate.touch(now_ms);
            }
            AttemptVerdict::Retry(reason)
        } else {
            candidate.match_status = MatchStatus::Rejected;
            candidate.touch(now_ms);
            AttemptVerdict::Rejected(reason)
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct VerificationEngine {
    config: VerificationConfig,
    policy: EscalationPolicy,
    text_thresholds: TextThresholds,
    target_description: Arc<str>,
    backends: VerifierBackends,
    text: Option<TextConfirmation>,
    runtime: Handle,
    tasks: InFlightTasks,
    text_tasks: InFlightTasks,
    metrics: PipelineMetrics,
    events_tx: mpsc::UnboundedSender<VerificationEvent>,
    events_rx: mpsc::UnboundedReceiver<VerificationEvent>,
    last_batch_ms: Option<f64>,
}

impl VerificationEngine {
    pub fn new(
        config: VerificationConfig,
        target_description: impl Into<String>,
        backends: VerifierBackends,
        text: Option<TextConfirmation>,
        runtime: Handle,
        metrics: PipelineMetrics,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let target_description: String = target_description.into();
        Self {
            policy: EscalationPolicy::from_config(&config),
            text_thresholds: TextThresholds::from_config(&config),
            config,
            target_description: Arc::from(target_description),
            backends,
            text,
            runtime,
            tasks: InFlightTasks::new(),
            text_tasks: InFlightTasks::new(),
            metrics,
            events_tx,
            events_rx,
            last_batch_ms: None,
        }
    }

    pub fn text_pass_configured(&self) -> bool {
        self.text.is_some()
    }

    /// One verification step for `frame`. Returns the candidates a backend
    /// call was dispatched for.
    pub fn tick(&mut self, frame: &Frame, store: &Arc<CandidateStore>) -> Vec<CandidateId> {
        let now = frame.timestamp_ms;
        self.tasks.prune_finished();
        self.text_tasks.prune_finished();

        self.recover_stuck_waiting(store, now);
        self.dispatch_text_passes(frame, store);

        if let Some(last) = self.last_batch_ms {
            if now - last < self.config.global_interval_ms {
                return Vec::new();
            }
        }

        let busy: HashSet<CandidateId> = self.tasks.active_ids().into_iter().collect();
        let capacity = self.config.max_in_flight.saturating_sub(busy.len());
        let eligible: Vec<Candidate> = store
            .snapshot()
            .into_iter()
            .filter(|c| !busy.contains(&c.id) && self.is_eligible(c, frame, now))
            .take(capacity)
            .collect();

        let mut dispatched = Vec::new();
        for candidate in eligible {
            if self.dispatch(&candidate, frame, store, now) {
                dispatched.push(candidate.id);
            }
        }

        if !dispatched.is_empty() {
            self.last_batch_ms = Some(now);
            debug!(
                "🔍 Dispatched {} verification(s) on frame {} ({} in flight)",
                dispatched.len(),
                frame.frame_id,
                self.tasks.len()
            );
        }
        dispatched
    }

    fn is_eligible(&self, c: &Candidate, frame: &Frame, now: f64) -> bool {
        let due = match c.match_status {
            MatchStatus::Unknown => c
                .last_verified_ms
                .map_or(true, |t| now - t >= self.config.per_candidate_interval_ms),
            MatchStatus::Full => match (self.config.reverify_interval_ms, c.last_verified_ms) {
                (Some(interval), Some(t)) => now - t >= interval,
                (Some(_), None) => true,
                (None, _) => false,
            },
            _ => false,
        };
        if !due {
            return false;
        }

        let bbox = c.bbox();
        if bbox.area() < self.config.min_area_fraction {
            return false;
        }
        let (pw, ph) = frame.pixel_size(&bbox);
        ph <= self.config.max_height_to_width * pw
    }

    /// `Waiting` with nothing in flight means the call was aborted.
    fn recover_stuck_waiting(&self, store: &CandidateStore, now: f64) {
        let busy: HashSet<CandidateId> = self.tasks.active_ids().into_iter().collect();
        store.update_all(|c| {
            if c.match_status == MatchStatus::Waiting && !busy.contains(&c.id) {
                debug!("Candidate {} stuck waiting, back to unknown", c.id);
                c.match_status = MatchStatus::Unknown;
                c.touch(now);
            }
        });
    }

    fn dispatch(
        &mut self,
        candidate: &Candidate,
        frame: &Frame,
        store: &Arc<CandidateStore>,
        now: f64,
    ) -> bool {
        let id = candidate.id;
        let Some(crop) = frame.crop(&candidate.bbox()) else {
            return false;
        };

        let policy = self.policy;
        let claimed = store.update(id, |c| {
            let reverify = c.is_full();
            if !reverify && c.match_status != MatchStatus::Unknown {
                return None;
            }
            let kind = policy.next_kind(&mut c.counters, c.view);
            if !reverify {
                c.match_status = MatchStatus::Waiting;
                c.touch(now);
            }
            c.last_verified_ms = Some(now);
            Some(kind)
        });
        let Some(Some(kind)) = claimed else {
            return false;
        };

        let backend = self.backends.get(kind);
        let description = Arc::clone(&self.target_description);
        let store = Arc::clone(store);
        let tasks = self.tasks.clone();
        let text_tasks = self.text_tasks.clone();
        let metrics = self.metrics.clone();
        let events = self.events_tx.clone();
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let text_configured = self.text.is_some();

        self.metrics.inc(&self.metrics.verifications_dispatched);
        debug!("🔍 Verifying {} with {} engine", id, kind.as_str());

        let handle = self.runtime.spawn(async move {
            let (outcome, timed_out) =
                match tokio::time::timeout(timeout, backend.verify(crop, &description)).await {
                    Ok(Ok(outcome)) => (outcome, false),
                    Ok(Err(e)) => {
                        warn!("⚠️ {} engine failed for {}: {:#}", kind.as_str(), id, e);
                        metrics.inc(&metrics.backend_errors);
                        (VerifierOutcome::transport_failure(), false)
                    }
                    Err(_) => {
                        warn!(
                            "⏱️ {} engine timed out after {:?} for {}",
                            kind.as_str(),
                            timeout,
                            id
                        );
                        metrics.inc(&metrics.verification_timeouts);
                        (VerifierOutcome::transport_failure(), true)
                    }
                };

            let completed_at = store.clock_ms();
            let verdict = store.update(id, |c| {
                apply_outcome(c, kind, &outcome, completed_at, text_configured)
            });
            let Some(verdict) = verdict else {
                debug!("Candidate {} gone before {} verdict landed", id, kind.as_str());
                return;
            };

            match verdict {
                AttemptVerdict::Confirmed => {
                    metrics.inc(&metrics.matches);
                    info!("🎯 Target found: candidate {} ({} engine)", id, kind.as_str());
                    let mut cancelled = tasks.cancel_all_except(id).len();
                    cancelled += text_tasks.cancel_all_except(id).len();
                    metrics.add(&metrics.cancellations, cancelled as u64);
                }
                AttemptVerdict::Partial => {
                    metrics.inc(&metrics.matches);
                    info!("🟡 Candidate {} matched description, awaiting text check", id);
                }
                AttemptVerdict::Retry(reason) => {
                    metrics.inc(&metrics.soft_rejections);
                    debug!("Candidate {} inconclusive ({}), will retry", id, reason.as_str());
                }
                AttemptVerdict::Rejected(reason) => {
                    metrics.inc(&metrics.hard_rejections);
                    info!("🚫 Candidate {} rejected: {}", id, reason.as_str());
                }
                AttemptVerdict::Refreshed => {
                    debug!("Target {} re-verified", id);
                }
            }

            let _ = events.send(VerificationEvent::Completed {
                id,
                engine: kind,
                verdict,
                timed_out,
            });
        });
        self.tasks.insert(id, handle);
        true
    }

    fn dispatch_text_passes(&mut self, frame: &Frame, store: &Arc<CandidateStore>) {
        let Some(text) = self.text.clone() else {
            return;
        };
        let now = frame.timestamp_ms;

        for candidate in store.snapshot() {
            if candidate.match_status != MatchStatus::Partial || self.text_tasks.contains(candidate.id) {
                continue;
            }
            if let Some(last) = candidate.last_ocr_ms {
                if now - last < self.config.ocr_interval_ms {
                    continue;
                }
            }
            let Some(crop) = frame.crop(&candidate.bbox()) else {
                continue;
            };

            let id = candidate.id;
            let recognizer = Arc::clone(&text.recognizer);
            let expected = text.expected.clone();
            let thresholds = self.text_thresholds;
            let store = Arc::clone(store);
            let tasks = self.tasks.clone();
            let text_tasks = self.text_tasks.clone();
            let metrics = self.metrics.clone();
            let events = self.events_tx.clone();
            let timeout = Duration::from_millis(self.config.timeout_ms);

            self.metrics.inc(&self.metrics.text_passes);
            debug!("🔤 Reading text on candidate {}", id);

            let handle = self.runtime.spawn(async move {
                let reading = match tokio::time::timeout(timeout, recognizer.recognize(crop)).await {
                    Ok(Ok(reading)) => reading,
                    Ok(Err(e)) => {
                        warn!("⚠️ Text recognition failed for {}: {:#}", id, e);
                        None
                    }
                    Err(_) => {
                        warn!("⏱️ Text recognition timed out for {}", id);
                        None
                    }
                };

                let completed_at = store.clock_ms();
                let result = store.update(id, |c| {
                    let verdict =
                        apply_text_reading(c, reading.as_ref(), &expected, &thresholds, completed_at);
                    (verdict, c.ocr_text.clone())
                });
                let Some((verdict, text)) = result else {
                    return;
                };

                match verdict {
                    TextVerdict::Confirmed => {
                        info!("🎯 Target found: candidate {} (text confirmed)", id);
                        let mut cancelled = tasks.cancel_all_except(id).len();
                        cancelled += text_tasks.cancel_all_except(id).len();
                        metrics.add(&metrics.cancellations, cancelled as u64);
                    }
                    TextVerdict::Rejected => {
                        metrics.inc(&metrics.hard_rejections);
                        info!("🚫 Candidate {} failed text check", id);
                    }
                    TextVerdict::Continue => {}
                }
                let _ = events.send(VerificationEvent::TextChecked { id, verdict, text });
            });
            self.text_tasks.insert(id, handle);
        }
    }

    /// Completions that landed since the last call.
    pub fn drain_events(&mut self) -> Vec<VerificationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Abort any call in flight for `id` (e.g. the candidate was removed).
    pub fn cancel(&self, id: CandidateId) -> bool {
        let cancelled = self.tasks.cancel(id) | self.text_tasks.cancel(id);
        if cancelled {
            self.metrics.inc(&self.metrics.cancellations);
        }
        cancelled
    }

    pub fn cancel_all_except(&self, keep: CandidateId) -> Vec<CandidateId> {
        let mut cancelled = self.tasks.cancel_all_except(keep);
        cancelled.extend(self.text_tasks.cancel_all_except(keep));
        self.metrics
            .add(&self.metrics.cancellations, cancelled.len() as u64);
        cancelled
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len() + self.text_tasks.len()
    }

    /// Wait for every spawned call to finish. Used by hosts at shutdown and
    /// by tests; the frame loop never calls this.
    pub async fn settle(&self) {
        self.tasks.settle().await;
        self.text_tasks.settle().await;
    }
}

impl Drop for VerificationEngine {
    fn drop(&mut self) {
        let aborted = self.tasks.cancel_all() + self.text_tasks.cancel_all();
        if aborted > 0 {
            debug!("Aborted {} in-flight call(s) on shutdown", aborted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::VehicleView;
    use crate::capabilities::TextReading;
    use crate::types::{BBox, Detection, ImageCrop};
    use anyhow::Result;
    use async_trait::async_trait;
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── Stub backends ──

    struct ScriptedBackend {
        delay: Duration,
        outcome: VerifierOutcome,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(delay_ms: u64, outcome: VerifierOutcome) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(delay_ms),
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl VerifierBackend for ScriptedBackend {
        async fn verify(&self, _crop: ImageCrop, _target: &str) -> Result<VerifierOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.outcome.clone())
        }
    }

    /// Matches crops on the left half of the frame, never answers otherwise.
    struct LeftHalfBackend;

    #[async_trait]
    impl VerifierBackend for LeftHalfBackend {
        async fn verify(&self, crop: ImageCrop, _target: &str) -> Result<VerifierOutcome> {
            if crop.source.x < 0.5 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(VerifierOutcome::matched("left"))
            } else {
                std::future::pending::<Result<VerifierOutcome>>().await
            }
        }
    }

    struct FixedReader(&'static str);

    #[async_trait]
    impl TextRecognizer for FixedReader {
        async fn recognize(&self, _crop: ImageCrop) -> Result<Option<TextReading>> {
            Ok(Some(TextReading {
                text: self.0.to_string(),
                confidence: 0.95,
            }))
        }
    }

    // ── Helpers ──

    fn candidate(bbox: BBox) -> Candidate {
        Candidate::from_detection(&Detection::new(bbox, "car", 0.9), None, 0.0).unwrap()
    }

    fn frame(id: u64, ts: f64) -> Frame {
        Frame::new(id, ts, RgbImage::new(64, 48))
    }

    fn engine_with(
        primary: Arc<dyn VerifierBackend>,
        llm: Arc<dyn VerifierBackend>,
        text: Option<TextConfirmation>,
    ) -> (VerificationEngine, PipelineMetrics) {
        engine_with_config(VerificationConfig::default(), primary, llm, text)
    }

    fn engine_with_config(
        config: VerificationConfig,
        primary: Arc<dyn VerifierBackend>,
        llm: Arc<dyn VerifierBackend>,
        text: Option<TextConfirmation>,
    ) -> (VerificationEngine, PipelineMetrics) {
        let metrics = PipelineMetrics::new();
        let engine = VerificationEngine::new(
            config,
            "red VW Golf",
            VerifierBackends { primary, llm },
            text,
            Handle::current(),
            metrics.clone(),
        );
        (engine, metrics)
    }

    // ── Outcome interpretation ──

    #[test]
    fn test_match_without_text_pass_is_full() {
        let mut c = candidate(BBox::new(0.1, 0.1, 0.2, 0.2));
        c.match_status = MatchStatus::Waiting;
        c.counters.primary_failures = 2;
        let outcome = VerifierOutcome::matched("red golf").with_view(VehicleView::Front, 0.8);
        let verdict = apply_outcome(&mut c, EngineKind::Primary, &outcome, 100.0, false);
        assert_eq!(verdict, AttemptVerdict::Confirmed);
        assert_eq!(c.match_status, MatchStatus::Full);
        assert_eq!(c.counters.primary_failures, 0);
        assert_eq!(c.view, Some(VehicleView::Front));
        assert_eq!(c.description.as_deref(), Some("red golf"));
        assert_eq!(c.last_primary_call_ms, Some(100.0));
    }

    #[test]
    fn test_match_with_text_pass_is_partial() {
        let mut c = candidate(BBox::new(0.1, 0.1, 0.2, 0.2));
        c.match_status = MatchStatus::Waiting;
        let verdict = apply_outcome(&mut c, EngineKind::Llm, &VerifierOutcome::matched("x"), 5.0, true);
        assert_eq!(verdict, AttemptVerdict::Partial);
        assert_eq!(c.match_status, MatchStatus::Partial);
        assert_eq!(c.last_llm_call_ms, Some(5.0));
    }

    #[test]
    fn test_retryable_failure_returns_to_unknown() {
        let mut c = candidate(BBox::new(0.1, 0.1, 0.2, 0.2));
        c.match_status = MatchStatus::Waiting;
        let outcome = VerifierOutcome::rejected(RejectReason::UnclearImage);
        let verdict = apply_outcome(&mut c, EngineKind::Primary, &outcome, 5.0, false);
        assert_eq!(verdict, AttemptVerdict::Retry(RejectReason::UnclearImage));
        assert_eq!(c.match_status, MatchStatus::Unknown);
        assert_eq!(c.counters.primary_failures, 1);
    }

    #[test]
    fn test_hard_failure_rejects_and_counts() {
        let mut c = candidate(BBox::new(0.1, 0.1, 0.2, 0.2));
        c.match_status = MatchStatus::Waiting;
        let outcome = VerifierOutcome::rejected(RejectReason::WrongObjectClass);
        let verdict = apply_outcome(&mut c, EngineKind::Llm, &outcome, 7.0, false);
        assert_eq!(verdict, AttemptVerdict::Rejected(RejectReason::WrongObjectClass));
        assert_eq!(c.match_status, MatchStatus::Rejected);
        assert_eq!(c.counters.llm_failures, 1);
        assert_eq!(c.last_updated_ms, 7.0);
    }

    #[test]
    fn test_non_match_without_reason_is_hard() {
        let mut c = candidate(BBox::new(0.1, 0.1, 0.2, 0.2));
        c.match_status = MatchStatus::Waiting;
        let outcome = VerifierOutcome {
            is_match: false,
            description: String::new(),
            reject_reason: None,
            view: None,
            view_score: None,
        };
        let verdict = apply_outcome(&mut c, EngineKind::Primary, &outcome, 1.0, false);
        assert_eq!(verdict, AttemptVerdict::Rejected(RejectReason::WrongAttributes));
    }

    #[test]
    fn test_reverify_keeps_full_on_soft_failure() {
        let mut c = candidate(BBox::new(0.1, 0.1, 0.2, 0.2));
        c.match_status = MatchStatus::Full;
        let soft = VerifierOutcome::rejected(RejectReason::Ambiguous);
        apply_outcome(&mut c, EngineKind::Primary, &soft, 1.0, false);
        assert_eq!(c.match_status, MatchStatus::Full);
        let ok = apply_outcome(&mut c, EngineKind::Primary, &VerifierOutcome::matched("x"), 2.0, false);
        assert_eq!(ok, AttemptVerdict::Refreshed);
        let hard = VerifierOutcome::rejected(RejectReason::WrongAttributes);
        apply_outcome(&mut c, EngineKind::Primary, &hard, 3.0, false);
        assert_eq!(c.match_status, MatchStatus::Rejected);
    }

    // ── Engine ──

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_retryable_failure() {
        let hanging: Arc<dyn VerifierBackend> = ScriptedBackend::new(60_000, VerifierOutcome::matched("late"));
        let (mut engine, metrics) = engine_with(hanging.clone(), hanging, None);
        let store = Arc::new(CandidateStore::default());
        let c = candidate(BBox::new(0.1, 0.1, 0.2, 0.2));
        let id = c.id;
        store.upsert(c);

        let dispatched = engine.tick(&frame(1, 0.0), &store);
        assert_eq!(dispatched, vec![id]);
        assert_eq!(store.get(id).unwrap().match_status, MatchStatus::Waiting);

        engine.settle().await;
        let after = store.get(id).unwrap();
        assert_eq!(after.match_status, MatchStatus::Unknown);
        assert_eq!(after.reject_reason, Some(RejectReason::ApiError));
        assert_eq!(after.counters.primary_failures, 1);
        assert_eq!(metrics.summary().verification_timeouts, 1);

        let events = engine.drain_events();
        assert_eq!(
            events,
            vec![VerificationEvent::Completed {
                id,
                engine: EngineKind::Primary,
                verdict: AttemptVerdict::Retry(RejectReason::ApiError),
                timed_out: true,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_eligibility_gates() {
        let backend: Arc<dyn VerifierBackend> = ScriptedBackend::new(10, VerifierOutcome::matched("x"));
        let (mut engine, _) = engine_with(backend.clone(), backend, None);
        let store = Arc::new(CandidateStore::default());
        // Under 1% of the frame
        store.upsert(candidate(BBox::new(0.1, 0.1, 0.05, 0.05)));
        // 64x48 frame: 3.2px wide, 33.6px tall
        store.upsert(candidate(BBox::new(0.6, 0.1, 0.05, 0.7)));
        assert!(engine.tick(&frame(1, 0.0), &store).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_throttle() {
        let backend: Arc<dyn VerifierBackend> =
            ScriptedBackend::new(10, VerifierOutcome::rejected(RejectReason::LowConfidence));
        let (mut engine, _) = engine_with(backend.clone(), backend, None);
        let store = Arc::new(CandidateStore::default());
        store.upsert(candidate(BBox::new(0.1, 0.1, 0.2, 0.2)));
        assert_eq!(engine.tick(&frame(1, 0.0), &store).len(), 1);
        engine.settle().await;

        let late = candidate(BBox::new(0.6, 0.6, 0.2, 0.2));
        let late_id = late.id;
        store.upsert(late);
        assert!(engine.tick(&frame(2, 500.0), &store).is_empty());
        assert_eq!(engine.tick(&frame(3, 1500.0), &store), vec![late_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_candidate_throttle() {
        let backend: Arc<dyn VerifierBackend> =
            ScriptedBackend::new(10, VerifierOutcome::rejected(RejectReason::LowConfidence));
        let (mut engine, _) = engine_with(backend.clone(), backend, None);
        let store = Arc::new(CandidateStore::default());
        store.upsert(candidate(BBox::new(0.1, 0.1, 0.2, 0.2)));

        assert_eq!(engine.tick(&frame(1, 0.0), &store).len(), 1);
        engine.settle().await;
        // Past the global interval but inside the per-candidate one
        assert!(engine.tick(&frame(2, 2000.0), &store).is_empty());
        assert_eq!(engine.tick(&frame(3, 3000.0), &store).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_winner_cancels_other_calls() {
        let backend: Arc<dyn VerifierBackend> = Arc::new(LeftHalfBackend);
        let (mut engine, metrics) = engine_with(backend.clone(), backend, None);
        let store = Arc::new(CandidateStore::default());
        let left = candidate(BBox::new(0.1, 0.1, 0.2, 0.2));
        let right = candidate(BBox::new(0.6, 0.6, 0.2, 0.2));
        let left_id = left.id;
        store.upsert(left);
        store.upsert(right);

        assert_eq!(engine.tick(&frame(1, 0.0), &store).len(), 2);
        engine.settle().await;

        assert_eq!(store.ids(), vec![left_id]);
        assert!(store.get(left_id).unwrap().is_full());
        let summary = metrics.summary();
        assert_eq!(summary.cancellations, 1);
        assert_eq!(summary.verification_timeouts, 0);
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_text_pass_promotes_partial() {
        let backend: Arc<dyn VerifierBackend> = ScriptedBackend::new(10, VerifierOutcome::matched("golf"));
        let text = TextConfirmation {
            recognizer: Arc::new(FixedReader("ABC 124")),
            expected: "ABC123".to_string(),
        };
        let (mut engine, _) = engine_with(backend.clone(), backend, Some(text));
        let store = Arc::new(CandidateStore::default());
        let c = candidate(BBox::new(0.1, 0.1, 0.2, 0.2));
        let id = c.id;
        store.upsert(c);

        engine.tick(&frame(1, 0.0), &store);
        engine.settle().await;
        assert_eq!(store.get(id).unwrap().match_status, MatchStatus::Partial);

        engine.tick(&frame(2, 33.0), &store);
        engine.settle().await;
        let done = store.get(id).unwrap();
        assert_eq!(done.match_status, MatchStatus::Full);
        assert_eq!(done.ocr_text.as_deref(), Some("ABC124"));

        let events = engine.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            VerificationEvent::TextChecked {
                verdict: TextVerdict::Confirmed,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_waiting_recovers() {
        let backend: Arc<dyn VerifierBackend> = ScriptedBackend::new(60_000, VerifierOutcome::matched("x"));
        let (mut engine, _) = engine_with(backend.clone(), backend, None);
        let store = Arc::new(CandidateStore::default());
        let c = candidate(BBox::new(0.1, 0.1, 0.2, 0.2));
        let id = c.id;
        store.upsert(c);

        engine.tick(&frame(1, 0.0), &store);
        assert!(engine.cancel(id));
        engine.tick(&frame(2, 33.0), &store);
        assert_eq!(store.get(id).unwrap().match_status, MatchStatus::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_text_confirmation_cancels_other_candidates() {
        let hanging: Arc<dyn VerifierBackend> =
            ScriptedBackend::new(60_000, VerifierOutcome::matched("late"));
        let text = TextConfirmation {
            recognizer: Arc::new(FixedReader("ABC123")),
            expected: "ABC123".to_string(),
        };
        let (mut engine, metrics) = engine_with(hanging.clone(), hanging, Some(text));
        let store = Arc::new(CandidateStore::default());

        let mut partial = candidate(BBox::new(0.1, 0.1, 0.2, 0.2));
        partial.match_status = MatchStatus::Partial;
        let partial_id = partial.id;
        store.upsert(partial);
        store.upsert(candidate(BBox::new(0.6, 0.1, 0.2, 0.2)));
        store.upsert(candidate(BBox::new(0.6, 0.6, 0.2, 0.2)));

        // Both unknown candidates go out; the partial one gets a text read
        assert_eq!(engine.tick(&frame(1, 0.0), &store).len(), 2);
        assert_eq!(engine.in_flight(), 3);

        engine.settle().await;
        assert_eq!(store.ids(), vec![partial_id]);
        assert!(store.get(partial_id).unwrap().is_full());
        let summary = metrics.summary();
        assert_eq!(summary.cancellations, 2);
        assert_eq!(summary.verification_timeouts, 0);
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_stops_at_in_flight_cap() {
        let hanging: Arc<dyn VerifierBackend> =
            ScriptedBackend::new(60_000, VerifierOutcome::matched("late"));
        let (mut engine, _) = engine_with(hanging.clone(), hanging, None);
        let store = Arc::new(CandidateStore::default());
        for i in 0..6 {
            store.upsert(candidate(BBox::new(0.05 + 0.15 * i as f32, 0.3, 0.12, 0.2)));
        }

        let cap = VerificationConfig::default().max_in_flight;
        assert_eq!(engine.tick(&frame(1, 0.0), &store).len(), cap);
        assert_eq!(store.count_with_status(MatchStatus::Waiting), cap);

        // Next batch window: still no free slot
        assert!(engine.tick(&frame(2, 1500.0), &store).is_empty());
        assert_eq!(store.count_with_status(MatchStatus::Unknown), 6 - cap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_target_is_reverified() {
        let backend: Arc<dyn VerifierBackend> =
            ScriptedBackend::new(10, VerifierOutcome::matched("still it"));
        let config = VerificationConfig {
            reverify_interval_ms: Some(10_000.0),
            ..VerificationConfig::default()
        };
        let (mut engine, _) = engine_with_config(config, backend.clone(), backend, None);
        let store = Arc::new(CandidateStore::default());
        let mut target = candidate(BBox::new(0.1, 0.1, 0.2, 0.2));
        target.match_status = MatchStatus::Full;
        target.last_verified_ms = Some(0.0);
        let id = target.id;
        store.upsert(target);

        assert!(engine.tick(&frame(1, 5000.0), &store).is_empty());
        assert_eq!(engine.tick(&frame(2, 10_000.0), &store), vec![id]);
        // Re-checks never demote a confirmed target while in flight
        assert_eq!(store.get(id).unwrap().match_status, MatchStatus::Full);

        engine.settle().await;
        let after = store.get(id).unwrap();
        assert!(after.is_full());
        assert_eq!(after.last_verified_ms, Some(10_000.0));
        assert_eq!(
            engine.drain_events(),
            vec![VerificationEvent::Completed {
                id,
                engine: EngineKind::Primary,
                verdict: AttemptVerdict::Refreshed,
                timed_out: false,
            }]
        );
    }
}
