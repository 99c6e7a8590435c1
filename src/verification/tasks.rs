// src/verification/tasks.rs
//
// Registry of spawned backend calls, keyed by candidate. Shared between the
// frame loop and the tasks themselves; at most one task per candidate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::candidate::CandidateId;

const SETTLE_POLL: Duration = Duration::from_millis(5);

#[derive(Clone, Default)]
pub struct InFlightTasks {
    inner: Arc<Mutex<HashMap<CandidateId, JoinHandle<()>>>>,
}

impl InFlightTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CandidateId, JoinHandle<()>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a task. A previous task for the same candidate is aborted.
    pub fn insert(&self, id: CandidateId, handle: JoinHandle<()>) {
        if let Some(previous) = self.lock().insert(id, handle) {
            previous.abort();
        }
    }

    /// True while a task for `id` is registered and still running.
    pub fn contains(&self, id: CandidateId) -> bool {
        self.lock().get(&id).map_or(false, |h| !h.is_finished())
    }

    pub fn active_ids(&self) -> Vec<CandidateId> {
        self.lock()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drop handles of tasks that already completed.
    pub fn prune_finished(&self) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, h| !h.is_finished());
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.lock().values().filter(|h| !h.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort the task for `id`. Returns true if a running task was aborted.
    pub fn cancel(&self, id: CandidateId) -> bool {
        match self.lock().remove(&id) {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                debug!("Cancelled in-flight verification for {}", id);
                true
            }
            _ => false,
        }
    }

    /// Abort every task except the one belonging to `keep`.
    pub fn cancel_all_except(&self, keep: CandidateId) -> Vec<CandidateId> {
        let mut map = self.lock();
        let victims: Vec<CandidateId> = map.keys().copied().filter(|id| *id != keep).collect();
        let mut cancelled = Vec::new();
        for id in victims {
            if let Some(handle) = map.remove(&id) {
                if !handle.is_finished() {
                    handle.abort();
                    cancelled.push(id);
                }
            }
        }
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let mut map = self.lock();
        let mut cancelled = 0;
        for (_, handle) in map.drain() {
            if !handle.is_finished() {
                handle.abort();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Wait until every registered task has finished or been aborted.
    /// Handles stay registered meanwhile, so cancellation still reaches them.
    pub async fn settle(&self) {
        while !self.is_empty() {
            tokio::time::sleep(SETTLE_POLL).await;
        }
        self.prune_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper(secs: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_except_keeps_winner() {
        let tasks = InFlightTasks::new();
        let winner = CandidateId::new();
        let a = CandidateId::new();
        let b = CandidateId::new();
        tasks.insert(winner, sleeper(60));
        tasks.insert(a, sleeper(60));
        tasks.insert(b, sleeper(60));

        let mut cancelled = tasks.cancel_all_except(winner);
        cancelled.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(cancelled, expected);
        assert!(tasks.contains(winner));
        assert!(!tasks.contains(a));
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_finished() {
        let tasks = InFlightTasks::new();
        let id = CandidateId::new();
        tasks.insert(id, sleeper(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(!tasks.contains(id));
        assert_eq!(tasks.prune_finished(), 1);
        assert!(tasks.active_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_waits_for_all() {
        let tasks = InFlightTasks::new();
        tasks.insert(CandidateId::new(), sleeper(3));
        tasks.insert(CandidateId::new(), sleeper(5));
        tasks.settle().await;
        assert!(tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_single() {
        let tasks = InFlightTasks::new();
        let id = CandidateId::new();
        tasks.insert(id, sleeper(10));
        assert!(tasks.cancel(id));
        assert!(!tasks.cancel(id));
        assert_eq!(tasks.cancel_all(), 0);
    }
}
