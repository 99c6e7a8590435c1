// src/verification/policy.rs
//
// Escalation between the fast/expensive primary engine and the slow/cheap
// LLM engine, driven by per-candidate consecutive-failure counters.
//
// Choosing an engine resets the other engine's counter, so a candidate that
// keeps failing alternates between the two indefinitely. The choice is
// sticky: once switched to the LLM the candidate stays there until the LLM
// itself exhausts its retries.

use crate::candidate::{EngineKind, VehicleView, VerificationCounters};
use crate::config::VerificationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub max_primary_retries: u32,
    pub max_llm_retries: u32,
    pub min_primary_retries: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::from_config(&VerificationConfig::default())
    }
}

impl EscalationPolicy {
    pub fn from_config(config: &VerificationConfig) -> Self {
        Self {
            max_primary_retries: config.max_primary_retries,
            max_llm_retries: config.max_llm_retries,
            min_primary_retries: config.min_primary_retries,
        }
    }

    /// Pick the engine for the next attempt and update `counters` for the
    /// switch.
    pub fn next_kind(
        &self,
        counters: &mut VerificationCounters,
        view: Option<VehicleView>,
    ) -> EngineKind {
        let side_view = view.map_or(false, |v| v.is_side());

        let next = if counters.llm_failures >= self.max_llm_retries {
            EngineKind::Primary
        } else if counters.primary_failures >= self.max_primary_retries {
            EngineKind::Llm
        } else if side_view && counters.primary_failures >= self.min_primary_retries {
            EngineKind::Llm
        } else if counters.active == EngineKind::Llm {
            EngineKind::Llm
        } else {
            EngineKind::Primary
        };

        counters.reset(next.other());
        counters.active = next;
        next
    }
}
