// src/pipeline/phase.rs

use serde::Serialize;

use crate::candidate::{Candidate, CandidateId};

/// What the pipeline believes this frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "ids", rename_all = "snake_case")]
pub enum Phase {
    Searching,
    Verifying(Vec<CandidateId>),
    Found(CandidateId),
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Searching => "SEARCHING",
            Self::Verifying(_) => "VERIFYING",
            Self::Found(_) => "FOUND",
        }
    }

    pub fn found(&self) -> Option<CandidateId> {
        match self {
            Self::Found(id) => Some(*id),
            _ => None,
        }
    }
}

/// Pure reduction of a store snapshot to a phase.
pub fn reduce_phase(candidates: &[Candidate]) -> Phase {
    if let Some(winner) = candidates.iter().find(|c| c.is_full()) {
        return Phase::Found(winner.id);
    }
    if candidates.is_empty() {
        Phase::Searching
    } else {
        Phase::Verifying(candidates.iter().map(|c| c.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::MatchStatus;
    use crate::types::{BBox, Detection};

    fn candidate(status: MatchStatus) -> Candidate {
        let det = Detection::new(BBox::new(0.2, 0.2, 0.2, 0.2), "car", 0.8);
        let mut c = Candidate::from_detection(&det, None, 0.0).unwrap();
        c.match_status = status;
        c
    }

    #[test]
    fn test_empty_is_searching() {
        assert_eq!(reduce_phase(&[]), Phase::Searching);
    }

    #[test]
    fn test_unconfirmed_candidates_are_verifying() {
        let snapshot = vec![
            candidate(MatchStatus::Unknown),
            candidate(MatchStatus::Waiting),
            candidate(MatchStatus::Partial),
        ];
        let ids: Vec<CandidateId> = snapshot.iter().map(|c| c.id).collect();
        assert_eq!(reduce_phase(&snapshot), Phase::Verifying(ids));
    }

    #[test]
    fn test_full_candidate_is_found() {
        let snapshot = vec![candidate(MatchStatus::Rejected), candidate(MatchStatus::Full)];
        assert_eq!(reduce_phase(&snapshot), Phase::Found(snapshot[1].id));
        assert_eq!(reduce_phase(&snapshot).found(), Some(snapshot[1].id));
    }

    #[test]
    fn test_reduction_is_pure() {
        let snapshot = vec![candidate(MatchStatus::Unknown), candidate(MatchStatus::Partial)];
        let before: Vec<MatchStatus> = snapshot.iter().map(|c| c.match_status).collect();
        let first = reduce_phase(&snapshot);
        let second = reduce_phase(&snapshot);
        assert_eq!(first, second);
        let after: Vec<MatchStatus> = snapshot.iter().map(|c| c.match_status).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_value(Phase::Searching).unwrap();
        assert_eq!(json["phase"], "searching");
    }
}
