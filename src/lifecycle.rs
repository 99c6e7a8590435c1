// src/lifecycle.rs
//
// Per-frame candidate bookkeeping:
//   1. ingest non-duplicate detections while no target is confirmed
//   2. enforce the single-winner invariant
//   3. count misses, expire lost candidates, free cooled-down rejections
//
// `last_updated_ms` only moves on status changes, so tracker motion does not
// keep a rejected candidate alive past its cooldown.

use tracing::{debug, info};

use crate::candidate::{Candidate, CandidateId, MatchStatus};
use crate::capabilities::{BoxTracker, Embedder};
use crate::config::VerificationConfig;
use crate::pipeline::FrameContext;
use crate::store::CandidateStore;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LifecycleReport {
    pub created: Vec<CandidateId>,
    pub removed: Vec<CandidateId>,
    /// A confirmed target was dropped this frame
    pub lost_target: bool,
    /// Candidates were dropped this frame and none are left
    pub all_lost: bool,
}

pub struct LifecycleManager {
    config: VerificationConfig,
}

impl LifecycleManager {
    pub fn new(config: VerificationConfig) -> Self {
        Self { config }
    }

    pub fn tick(
        &self,
        ctx: &mut FrameContext,
        store: &CandidateStore,
        embedder: &dyn Embedder,
        tracker: &mut dyn BoxTracker,
    ) -> LifecycleReport {
        let mut report = LifecycleReport::default();
        let now = ctx.timestamp_ms();

        // ── 1. Ingest ──
        if !store.has_full() {
            for idx in 0..ctx.detections.len() {
                let det = ctx.detections[idx].clone();
                if store.contains_duplicate_of(&det.bbox) {
                    continue;
                }
                let embedding = ctx.detection_embedding(idx, embedder);
                let Some(candidate) = Candidate::from_detection(&det, embedding, now) else {
                    debug!("Skipping degenerate detection {:?}", det.bbox);
                    continue;
                };
                let id = candidate.id;
                let bbox = candidate.bbox();
                tracker.start(id, &ctx.frame, bbox);
                store.upsert(candidate);
                info!(
                    "🆕 Candidate {} ({}, conf={:.2}) at [{:.2},{:.2} {:.2}x{:.2}]",
                    id, det.label, det.confidence, bbox.x, bbox.y, bbox.width, bbox.height
                );
                report.created.push(id);
            }
        }

        // ── 2. Single winner ──
        report.removed.extend(store.prune_to_single_matched());

        // ── 3. Miss counting and expiry ──
        if ctx.detections_valid {
            let overlap_iou = self.config.overlap_iou;
            let detections = &ctx.detections;
            store.update_all(|c| {
                let bbox = c.bbox();
                if detections.iter().any(|d| d.bbox.iou(&bbox) > overlap_iou) {
                    c.miss_count = 0;
                } else {
                    c.miss_count += 1;
                }
            });
        }

        let miss_threshold = self.config.miss_threshold;
        let cooldown = self.config.reject_cooldown_ms;
        let expired = store.remove_where(|c| {
            c.miss_count >= miss_threshold
                || (c.match_status == MatchStatus::Rejected && now - c.last_updated_ms >= cooldown)
        });

        for c in &expired {
            if c.is_full() {
                report.lost_target = true;
                info!("❌ Target {} lost after {} missed frames", c.id, c.miss_count);
            } else if c.match_status == MatchStatus::Rejected && c.miss_count < miss_threshold {
                debug!("Rejected candidate {} cooled down, slot freed", c.id);
            } else {
                debug!("Candidate {} expired after {} misses", c.id, c.miss_count);
            }
            report.removed.push(c.id);
        }

        report.all_lost = !report.removed.is_empty() && store.is_empty();
        report
    }
}
