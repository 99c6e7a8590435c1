// src/drift_repair.rs
//
// Periodic re-anchoring of tracked boxes onto fresh detections.
//
// Frame-to-frame trackers accumulate positional error. Every N frames each
// candidate that has an embedding looks for the unclaimed detection that
// looks most like it; above the similarity threshold the candidate's box,
// embedding and tracker handle are all moved onto that detection. Each
// detection can be claimed by at most one candidate per cycle.

use tracing::{debug, info};

use crate::candidate::{CandidateId, MatchStatus};
use crate::capabilities::{BoxTracker, Embedder};
use crate::config::DriftConfig;
use crate::pipeline::FrameContext;
use crate::store::CandidateStore;
use crate::types::BBox;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftCorrection {
    pub id: CandidateId,
    pub from: BBox,
    pub to: BBox,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DriftStats {
    pub runs: u64,
    pub corrections: u64,
}

pub struct DriftRepair {
    config: DriftConfig,
    frames_since_run: u64,
    stats: DriftStats,
}

impl DriftRepair {
    pub fn new(config: DriftConfig) -> Self {
        Self {
            config,
            frames_since_run: 0,
            stats: DriftStats::default(),
        }
    }

    /// Advance the cadence counter; true on frames where repair should run.
    pub fn is_due(&mut self) -> bool {
        if self.config.interval_frames == 0 {
            return false;
        }
        self.frames_since_run += 1;
        if self.frames_since_run >= self.config.interval_frames {
            self.frames_since_run = 0;
            true
        } else {
            false
        }
    }

    /// Run one repair cycle against the detections in `ctx`.
    pub fn run(
        &mut self,
        ctx: &mut FrameContext,
        store: &CandidateStore,
        embedder: &dyn Embedder,
        tracker: &mut dyn BoxTracker,
    ) -> Vec<DriftCorrection> {
        self.stats.runs += 1;
        let mut corrections = Vec::new();
        if ctx.detections.is_empty() {
            return corrections;
        }

        // Confirmed and partially matched candidates pick first.
        let mut candidates = store.snapshot();
        candidates.sort_by_key(|c| match c.match_status {
            MatchStatus::Full => 0,
            MatchStatus::Partial => 1,
            MatchStatus::Waiting | MatchStatus::Unknown => 2,
            MatchStatus::Rejected => 3,
        });

        let mut claimed = vec![false; ctx.detections.len()];

        for candidate in &candidates {
            let Some(reference) = candidate.embedding.as_ref() else {
                continue;
            };

            let mut best: Option<(usize, f32)> = None;
            for idx in 0..ctx.detections.len() {
                if claimed[idx] {
                    continue;
                }
                let Some(emb) = ctx.detection_embedding(idx, embedder) else {
                    continue;
                };
                let sim = embedder.similarity(reference, &emb);
                if sim > self.config.min_similarity && best.map_or(true, |(_, s)| sim > s) {
                    best = Some((idx, sim));
                }
            }

            let Some((idx, similarity)) = best else {
                debug!("Drift repair: no match for candidate {}", candidate.id);
                continue;
            };

            let Some(embedding) = ctx.detection_embedding(idx, embedder) else {
                continue;
            };
            let target = ctx.detections[idx].bbox;
            let moved = store.update(candidate.id, |c| {
                if c.set_bbox(target) {
                    c.embedding = Some(embedding);
                    Some(c.bbox())
                } else {
                    None
                }
            });

            if let Some(Some(anchored)) = moved {
                claimed[idx] = true;
                tracker.reset(candidate.id, &ctx.frame, anchored);
                self.stats.corrections += 1;
                debug!(
                    "🔧 Re-anchored {} (sim={:.3}) [{:.2},{:.2}] -> [{:.2},{:.2}]",
                    candidate.id,
                    similarity,
                    candidate.bbox().x,
                    candidate.bbox().y,
                    anchored.x,
                    anchored.y
                );
                corrections.push(DriftCorrection {
                    id: candidate.id,
                    from: candidate.bbox(),
                    to: anchored,
                    similarity,
                });
            }
        }

        if !corrections.is_empty() {
            info!(
                "🔧 Drift repair re-anchored {} candidate(s) on frame {}",
                corrections.len(),
                ctx.frame_id()
            );
        }
        corrections
    }

    pub fn stats(&self) -> DriftStats {
        self.stats
    }
}
