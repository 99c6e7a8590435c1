// src/verification/text_confirmation.rs
//
// Secondary confirmation for partially matched candidates: read identifying
// text off the crop (a licence plate, a fleet number) and compare it with
// the expected value by edit distance.

use serde::Serialize;
use tracing::{debug, info};

use crate::candidate::{Candidate, MatchStatus, RejectReason};
use crate::capabilities::TextReading;
use crate::config::VerificationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextVerdict {
    /// Close enough: candidate promoted to `Full`
    Confirmed,
    /// Inconclusive: stays `Partial` and is read again later
    Continue,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextThresholds {
    pub max_edits_for_match: usize,
    pub max_edits_for_continue: usize,
    pub max_attempts: u32,
    pub min_confidence: f32,
}

impl TextThresholds {
    pub fn from_config(config: &VerificationConfig) -> Self {
        Self {
            max_edits_for_match: config.max_edits_for_match,
            max_edits_for_continue: config.max_edits_for_continue,
            max_attempts: config.max_ocr_attempts,
            min_confidence: config.min_ocr_confidence,
        }
    }

    /// Verdict for an edit distance, before the attempt cap is applied.
    pub fn judge(&self, distance: usize) -> TextVerdict {
        if distance <= self.max_edits_for_match {
            TextVerdict::Confirmed
        } else if distance <= self.max_edits_for_continue {
            TextVerdict::Continue
        } else {
            TextVerdict::Rejected
        }
    }
}

/// Uppercase alphanumerics only; spacing and punctuation on plates vary.
pub fn normalize_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_uppercase())
        .collect()
}

/// Levenshtein distance over chars.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Fold one recognition result into a `Partial` candidate.
///
/// A missing or low-confidence reading counts as an attempt. Once
/// `max_attempts` readings have been inconclusive the candidate is rejected.
pub fn apply_text_reading(
    candidate: &mut Candidate,
    reading: Option<&TextReading>,
    expected: &str,
    thresholds: &TextThresholds,
    now_ms: f64,
) -> TextVerdict {
    if candidate.match_status != MatchStatus::Partial {
        return TextVerdict::Continue;
    }

    candidate.ocr_attempts += 1;
    candidate.last_ocr_ms = Some(now_ms);

    let usable = reading
        .filter(|r| r.confidence >= thresholds.min_confidence)
        .map(|r| normalize_text(&r.text))
        .filter(|t| !t.is_empty());

    let mut verdict = match usable {
        Some(text) => {
            let distance = edit_distance(&text, &normalize_text(expected));
            debug!(
                "🔤 Candidate {} read '{}' (distance {} from expected)",
                candidate.id, text, distance
            );
            candidate.ocr_text = Some(text);
            thresholds.judge(distance)
        }
        None => TextVerdict::Continue,
    };

    if verdict == TextVerdict::Continue && candidate.ocr_attempts >= thresholds.max_attempts {
        debug!(
            "🔤 Candidate {} still inconclusive after {} reads",
            candidate.id, candidate.ocr_attempts
        );
        verdict = TextVerdict::Rejected;
    }

    match verdict {
        TextVerdict::Confirmed => {
            candidate.match_status = MatchStatus::Full;
            candidate.reject_reason = None;
            candidate.touch(now_ms);
            info!("🔤 Text confirmed for candidate {}", candidate.id);
        }
        TextVerdict::Rejected => {
            candidate.match_status = MatchStatus::Rejected;
            candidate.reject_reason = Some(RejectReason::PlateMismatch);
            candidate.touch(now_ms);
        }
        TextVerdict::Continue => {}
    }
    verdict
}
