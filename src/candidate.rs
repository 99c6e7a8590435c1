// src/candidate.rs
//
// A candidate is one tracked hypothesis that a detected object is the
// target. Candidates are created by the lifecycle manager, moved by the
// tracker and drift repair, and judged by the verification engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::types::{BBox, Detection, Embedding};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateId(Uuid);

impl CandidateId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell candidates apart in logs.
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

// ============================================================================
// STATUS, REASONS, VIEWS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Not verified yet, or a retryable attempt failed
    Unknown,
    /// A backend call is in flight
    Waiting,
    /// Description matched, text confirmation pending
    Partial,
    /// Confirmed target
    Full,
    Rejected,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Waiting => "WAITING",
            Self::Partial => "PARTIAL",
            Self::Full => "FULL",
            Self::Rejected => "REJECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    // Retryable
    UnclearImage,
    LowConfidence,
    Ambiguous,
    InsufficientInfo,
    ApiError,
    // Hard
    WrongObjectClass,
    WrongAttributes,
    PlateMismatch,
}

impl RejectReason {
    /// Retryable reasons send the candidate back to `Unknown` instead of
    /// rejecting it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UnclearImage
                | Self::LowConfidence
                | Self::Ambiguous
                | Self::InsufficientInfo
                | Self::ApiError
        )
    }

    /// Lenient parse of a backend-supplied reason code.
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        match key.as_str() {
            "unclear_image" | "unclear" | "blurry" => Some(Self::UnclearImage),
            "low_confidence" => Some(Self::LowConfidence),
            "ambiguous" => Some(Self::Ambiguous),
            "insufficient_info" | "insufficient_visible_area" | "occluded" => {
                Some(Self::InsufficientInfo)
            }
            "api_error" | "timeout" | "transport_error" => Some(Self::ApiError),
            "wrong_object_class" | "wrong_class" | "not_a_vehicle" => {
                Some(Self::WrongObjectClass)
            }
            "wrong_attributes" | "wrong_make_model" | "wrong_make" | "wrong_model"
            | "wrong_color" | "wrong_colour" => Some(Self::WrongAttributes),
            "plate_mismatch" | "license_plate_mismatch" => Some(Self::PlateMismatch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnclearImage => "unclear_image",
            Self::LowConfidence => "low_confidence",
            Self::Ambiguous => "ambiguous",
            Self::InsufficientInfo => "insufficient_info",
            Self::ApiError => "api_error",
            Self::WrongObjectClass => "wrong_object_class",
            Self::WrongAttributes => "wrong_attributes",
            Self::PlateMismatch => "plate_mismatch",
        }
    }
}

/// Orientation of the object relative to the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleView {
    Front,
    Rear,
    Side,
    FrontSide,
    RearSide,
}

impl VehicleView {
    /// Side-on views are the hardest for the primary engine.
    pub fn is_side(&self) -> bool {
        matches!(self, Self::Side)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "front" => Some(Self::Front),
            "rear" | "back" => Some(Self::Rear),
            "side" | "left" | "right" | "profile" => Some(Self::Side),
            "front_side" | "front_left" | "front_right" => Some(Self::FrontSide),
            "rear_side" | "rear_left" | "rear_right" => Some(Self::RearSide),
            _ => None,
        }
    }
}

/// Which verifier backend an attempt goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Fast, expensive recognition service
    Primary,
    /// Slow, cheap vision-language model
    Llm,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Llm => "llm",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::Primary => Self::Llm,
            Self::Llm => Self::Primary,
        }
    }
}

/// Consecutive failures per backend, plus the backend currently in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCounters {
    pub primary_failures: u32,
    pub llm_failures: u32,
    pub active: EngineKind,
}

impl Default for VerificationCounters {
    fn default() -> Self {
        Self {
            primary_failures: 0,
            llm_failures: 0,
            active: EngineKind::Primary,
        }
    }
}

impl VerificationCounters {
    pub fn failures(&self, kind: EngineKind) -> u32 {
        match kind {
            EngineKind::Primary => self.primary_failures,
            EngineKind::Llm => self.llm_failures,
        }
    }

    pub fn record_failure(&mut self, kind: EngineKind) {
        match kind {
            EngineKind::Primary => self.primary_failures += 1,
            EngineKind::Llm => self.llm_failures += 1,
        }
    }

    pub fn reset(&mut self, kind: EngineKind) {
        match kind {
            EngineKind::Primary => self.primary_failures = 0,
            EngineKind::Llm => self.llm_failures = 0,
        }
    }
}

// ============================================================================
// CANDIDATE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    bbox: BBox,
    pub label: String,
    pub embedding: Option<Embedding>,
    pub match_status: MatchStatus,
    pub miss_count: u32,
    pub ocr_attempts: u32,
    pub ocr_text: Option<String>,
    pub counters: VerificationCounters,
    pub view: Option<VehicleView>,
    pub view_score: f32,
    /// Description reported by the backend that matched
    pub description: Option<String>,
    pub created_at_ms: f64,
    pub last_updated_ms: f64,
    pub last_verified_ms: Option<f64>,
    pub last_primary_call_ms: Option<f64>,
    pub last_llm_call_ms: Option<f64>,
    pub last_ocr_ms: Option<f64>,
    pub reject_reason: Option<RejectReason>,
}

impl Candidate {
    /// Build a candidate from a detection. Returns `None` when the detection
    /// box is unusable.
    pub fn from_detection(
        det: &Detection,
        embedding: Option<Embedding>,
        timestamp_ms: f64,
    ) -> Option<Self> {
        let bbox = det.bbox.clamped()?;
        Some(Self {
            id: CandidateId::new(),
            bbox,
            label: det.label.clone(),
            embedding,
            match_status: MatchStatus::Unknown,
            miss_count: 0,
            ocr_attempts: 0,
            ocr_text: None,
            counters: VerificationCounters::default(),
            view: None,
            view_score: 0.0,
            description: None,
            created_at_ms: timestamp_ms,
            last_updated_ms: timestamp_ms,
            last_verified_ms: None,
            last_primary_call_ms: None,
            last_llm_call_ms: None,
            last_ocr_ms: None,
            reject_reason: None,
        })
    }

    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    /// Move the candidate. Degenerate boxes are refused so the stored box
    /// stays valid for the candidate's whole life.
    pub fn set_bbox(&mut self, bbox: BBox) -> bool {
        match bbox.clamped() {
            Some(b) => {
                self.bbox = b;
                true
            }
            None => false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.match_status == MatchStatus::Full
    }

    pub fn touch(&mut self, timestamp_ms: f64) {
        if timestamp_ms > self.last_updated_ms {
            self.last_updated_ms = timestamp_ms;
        }
    }

    /// Keep the most confident orientation seen so far.
    pub fn observe_view(&mut self, view: VehicleView, score: f32) {
        if self.view.is_none() || score >= self.view_score {
            self.view = Some(view);
            self.view_score = score;
        }
    }

    pub fn stamp_call(&mut self, kind: EngineKind, timestamp_ms: f64) {
        match kind {
            EngineKind::Primary => self.last_primary_call_ms = Some(timestamp_ms),
            EngineKind::Llm => self.last_llm_call_ms = Some(timestamp_ms),
        }
    }
}
