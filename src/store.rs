// src/store.rs
//
// Shared, mutex-serialized collection of candidates. The frame loop and the
// asynchronous verification tasks both write here; every write happens under
// one lock so `snapshot()` never sees a half-applied mutation.
//
// The single-winner invariant is enforced at write time: whenever a write
// leaves a candidate in `Full`, every other candidate is dropped in the same
// critical section.

use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::candidate::{Candidate, CandidateId, MatchStatus};
use crate::types::BBox;

#[derive(Debug, Clone, Copy)]
pub struct DuplicateThresholds {
    /// IoU strictly above this marks a duplicate
    pub iou: f32,
    /// Center distance strictly below this marks a duplicate
    pub center_distance: f32,
}

impl Default for DuplicateThresholds {
    fn default() -> Self {
        Self {
            iou: 0.6,
            center_distance: 0.15,
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    candidates: Vec<Candidate>,
    /// Timestamp of the most recent frame seen by the pipeline
    clock_ms: f64,
}

impl StoreInner {
    fn position(&self, id: CandidateId) -> Option<usize> {
        self.candidates.iter().position(|c| c.id == id)
    }

    /// Drop everything except `winner`. Returns the removed ids.
    fn retain_only(&mut self, winner: CandidateId) -> Vec<CandidateId> {
        let removed: Vec<CandidateId> = self
            .candidates
            .iter()
            .filter(|c| c.id != winner)
            .map(|c| c.id)
            .collect();
        if !removed.is_empty() {
            self.candidates.retain(|c| c.id == winner);
            info!(
                "🏆 Candidate {} is the single winner, dropped {} other(s)",
                winner,
                removed.len()
            );
        }
        removed
    }
}

#[derive(Debug, Default)]
pub struct CandidateStore {
    inner: Mutex<StoreInner>,
    thresholds: DuplicateThresholds,
}

impl CandidateStore {
    pub fn new(thresholds: DuplicateThresholds) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            thresholds,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A panicking writer cannot leave a candidate half-written: every
        // mutation replaces whole fields, so the data is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a candidate by id. A `Full` candidate evicts all
    /// others; returns the ids evicted that way.
    pub fn upsert(&self, candidate: Candidate) -> Vec<CandidateId> {
        let mut inner = self.lock();
        let id = candidate.id;
        let is_full = candidate.is_full();
        match inner.position(id) {
            Some(idx) => inner.candidates[idx] = candidate,
            None => inner.candidates.push(candidate),
        }
        if is_full {
            inner.retain_only(id)
        } else {
            Vec::new()
        }
    }

    pub fn remove(&self, id: CandidateId) -> Option<Candidate> {
        let mut inner = self.lock();
        let idx = inner.position(id)?;
        Some(inner.candidates.remove(idx))
    }

    /// Apply `mutator` to one candidate under the store lock. Returns `None`
    /// if the candidate no longer exists.
    pub fn update<R>(&self, id: CandidateId, mutator: impl FnOnce(&mut Candidate) -> R) -> Option<R> {
        let mut inner = self.lock();
        let idx = inner.position(id)?;
        let result = mutator(&mut inner.candidates[idx]);
        if inner.candidates[idx].is_full() {
            inner.retain_only(id);
        }
        Some(result)
    }

    /// Apply `mutator` to every candidate under a single lock.
    pub fn update_all(&self, mut mutator: impl FnMut(&mut Candidate)) {
        let mut inner = self.lock();
        for c in inner.candidates.iter_mut() {
            mutator(c);
        }
        if let Some(winner) = newest_full(&inner.candidates) {
            inner.retain_only(winner);
        }
    }

    /// Remove every candidate matching `predicate` and return them.
    pub fn remove_where(&self, mut predicate: impl FnMut(&Candidate) -> bool) -> Vec<Candidate> {
        let mut inner = self.lock();
        let (removed, kept): (Vec<Candidate>, Vec<Candidate>) =
            inner.candidates.drain(..).partition(|c| predicate(c));
        inner.candidates = kept;
        removed
    }

    /// Owned copy of every candidate, in insertion order.
    pub fn snapshot(&self) -> Vec<Candidate> {
        self.lock().candidates.clone()
    }

    pub fn get(&self, id: CandidateId) -> Option<Candidate> {
        let inner = self.lock();
        inner.position(id).map(|idx| inner.candidates[idx].clone())
    }

    pub fn contains(&self, id: CandidateId) -> bool {
        self.lock().position(id).is_some()
    }

    pub fn ids(&self) -> Vec<CandidateId> {
        self.lock().candidates.iter().map(|c| c.id).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().candidates.is_empty()
    }

    pub fn find_full(&self) -> Option<CandidateId> {
        self.lock()
            .candidates
            .iter()
            .find(|c| c.is_full())
            .map(|c| c.id)
    }

    pub fn has_full(&self) -> bool {
        self.find_full().is_some()
    }

    /// True if `bbox` overlaps an existing candidate above the IoU threshold
    /// or sits within the center-distance threshold of one.
    pub fn contains_duplicate_of(&self, bbox: &BBox) -> bool {
        let t = self.thresholds;
        self.lock().candidates.iter().any(|c| {
            let existing = c.bbox();
            existing.iou(bbox) > t.iou || existing.center_distance(bbox) < t.center_distance
        })
    }

    /// Keep only the most recently updated `Full` candidate. No-op when
    /// nothing is `Full`. Returns the removed ids.
    pub fn prune_to_single_matched(&self) -> Vec<CandidateId> {
        let mut inner = self.lock();
        match newest_full(&inner.candidates) {
            Some(winner) => inner.retain_only(winner),
            None => Vec::new(),
        }
    }

    pub fn clock_ms(&self) -> f64 {
        self.lock().clock_ms
    }

    /// Record the latest frame time. Never moves backwards.
    pub fn advance_clock(&self, timestamp_ms: f64) {
        let mut inner = self.lock();
        if timestamp_ms > inner.clock_ms {
            inner.clock_ms = timestamp_ms;
        } else if timestamp_ms < inner.clock_ms {
            debug!(
                "Ignoring out-of-order frame time {:.1}ms (clock at {:.1}ms)",
                timestamp_ms, inner.clock_ms
            );
        }
    }

    pub fn count_with_status(&self, status: MatchStatus) -> usize {
        self.lock()
            .candidates
            .iter()
            .filter(|c| c.match_status == status)
            .count()
    }
}

fn newest_full(candidates: &[Candidate]) -> Option<CandidateId> {
    candidates
        .iter()
        .filter(|c| c.is_full())
        .max_by(|a, b| {
            a.last_updated_ms
                .partial_cmp(&b.last_updated_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|c| c.id)
}
