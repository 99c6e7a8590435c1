// src/pipeline/metrics.rs
//
// Running totals for the frame loop and the verification tasks it spawns.
// One shared counter block; every clone of `PipelineMetrics` points at it.

use serde::Serialize;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Counters {
    pub total_frames: AtomicU64,
    pub detector_failures: AtomicU64,
    pub candidates_created: AtomicU64,
    pub candidates_removed: AtomicU64,
    pub targets_lost: AtomicU64,
    pub verifications_dispatched: AtomicU64,
    pub verification_timeouts: AtomicU64,
    pub backend_errors: AtomicU64,
    pub matches: AtomicU64,
    pub soft_rejections: AtomicU64,
    pub hard_rejections: AtomicU64,
    pub cancellations: AtomicU64,
    pub text_passes: AtomicU64,
    pub drift_repairs: AtomicU64,
    last_frame_us: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    counters: Arc<Counters>,
}

impl Deref for PipelineMetrics {
    type Target = Counters;

    fn deref(&self) -> &Counters {
        &self.counters
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, counter: &AtomicU64) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Wall time spent in the most recent `process_frame`.
    pub fn record_frame_time(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.last_frame_us.store(us, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        let c = &self.counters;
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSummary {
            total_frames: get(&c.total_frames),
            detector_failures: get(&c.detector_failures),
            candidates_created: get(&c.candidates_created),
            candidates_removed: get(&c.candidates_removed),
            targets_lost: get(&c.targets_lost),
            verifications_dispatched: get(&c.verifications_dispatched),
            verification_timeouts: get(&c.verification_timeouts),
            backend_errors: get(&c.backend_errors),
            matches: get(&c.matches),
            soft_rejections: get(&c.soft_rejections),
            hard_rejections: get(&c.hard_rejections),
            cancellations: get(&c.cancellations),
            text_passes: get(&c.text_passes),
            drift_repairs: get(&c.drift_repairs),
            last_frame_us: get(&c.last_frame_us),
        }
    }
}

/// Point-in-time copy of the counters, printed by the replay binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSummary {
    pub total_frames: u64,
    pub detector_failures: u64,
    pub candidates_created: u64,
    pub candidates_removed: u64,
    pub targets_lost: u64,
    pub verifications_dispatched: u64,
    pub verification_timeouts: u64,
    pub backend_errors: u64,
    pub matches: u64,
    pub soft_rejections: u64,
    pub hard_rejections: u64,
    pub cancellations: u64,
    pub text_passes: u64,
    pub drift_repairs: u64,
    pub last_frame_us: u64,
}
