// src/pipeline/event_bus.rs
//
// Lifecycle, verification and drift events queued for the host, which
// drains them after each frame.

use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::candidate::{CandidateId, EngineKind};
use crate::drift_repair::DriftCorrection;
use crate::verification::{AttemptVerdict, TextVerdict, VerificationEvent};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    CandidateCreated {
        id: CandidateId,
        frame_id: u64,
    },

    CandidateRemoved {
        id: CandidateId,
        frame_id: u64,
    },

    TargetFound {
        id: CandidateId,
        frame_id: u64,
    },

    TargetLost {
        frame_id: u64,
    },

    VerificationCompleted {
        id: CandidateId,
        engine: EngineKind,
        verdict: AttemptVerdict,
        timed_out: bool,
    },

    TextConfirmation {
        id: CandidateId,
        verdict: TextVerdict,
        text: Option<String>,
    },

    DriftRepaired {
        id: CandidateId,
        frame_id: u64,
        similarity: f32,
    },
}

impl PipelineEvent {
    pub fn drift(correction: &DriftCorrection, frame_id: u64) -> Self {
        Self::DriftRepaired {
            id: correction.id,
            frame_id,
            similarity: correction.similarity,
        }
    }
}

impl From<VerificationEvent> for PipelineEvent {
    fn from(event: VerificationEvent) -> Self {
        match event {
            VerificationEvent::Completed {
                id,
                engine,
                verdict,
                timed_out,
            } => Self::VerificationCompleted {
                id,
                engine,
                verdict,
                timed_out,
            },
            VerificationEvent::TextChecked { id, verdict, text } => {
                Self::TextConfirmation { id, verdict, text }
            }
        }
    }
}

/// Bounded queue between the frame loop and the host. A host that falls
/// behind loses the oldest events first.
pub struct EventBus {
    pending: VecDeque<PipelineEvent>,
    capacity: usize,
    dropped: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pending: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn publish(&mut self, event: PipelineEvent) {
        if self.pending.len() == self.capacity {
            self.pending.pop_front();
            if self.dropped == 0 {
                warn!("⚠️ Event queue full ({}), dropping oldest until the next drain", self.capacity);
            }
            self.dropped += 1;
        }
        self.pending.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        if self.dropped > 0 {
            debug!("{} event(s) dropped since last drain", self.dropped);
            self.dropped = 0;
        }
        std::mem::take(&mut self.pending).into()
    }
}
