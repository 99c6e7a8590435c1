// src/capabilities.rs
//
// Contracts for the collaborators the pipeline drives but does not
// implement: detection model, box tracker, embedding model, verifier
// backends, OCR, depth, and the navigation/UI sink.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::candidate::{CandidateId, RejectReason, VehicleView};
use crate::pipeline::FrameReport;
use crate::types::{BBox, Detection, Embedding, Frame, ImageCrop};

pub trait Detector: Send {
    /// Detect objects whose label is in `class_filter` (empty = everything).
    fn detect(&mut self, frame: &Frame, class_filter: &[String]) -> Result<Vec<Detection>>;
}

/// Per-candidate result of one tracker step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackUpdate {
    Moved { id: CandidateId, bbox: BBox },
    Failed { id: CandidateId },
}

/// Stateful frame-to-frame box predictor holding one handle per candidate.
pub trait BoxTracker: Send {
    fn start(&mut self, id: CandidateId, frame: &Frame, bbox: BBox);
    /// Re-anchor an existing handle on a new box.
    fn reset(&mut self, id: CandidateId, frame: &Frame, bbox: BBox);
    fn stop(&mut self, id: CandidateId);
    fn tick(&mut self, frame: &Frame) -> Vec<TrackUpdate>;
}

pub trait Embedder: Send + Sync {
    fn embed(&self, crop: &ImageCrop) -> Result<Embedding>;

    /// Similarity in [0, 1].
    fn similarity(&self, a: &Embedding, b: &Embedding) -> f32 {
        a.cosine(b)
    }
}

/// What a verifier backend concluded about one crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierOutcome {
    pub is_match: bool,
    #[serde(default)]
    pub description: String,
    pub reject_reason: Option<RejectReason>,
    pub view: Option<VehicleView>,
    pub view_score: Option<f32>,
}

impl VerifierOutcome {
    pub fn matched(description: impl Into<String>) -> Self {
        Self {
            is_match: true,
            description: description.into(),
            reject_reason: None,
            view: None,
            view_score: None,
        }
    }

    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            is_match: false,
            description: String::new(),
            reject_reason: Some(reason),
            view: None,
            view_score: None,
        }
    }

    pub fn with_view(mut self, view: VehicleView, score: f32) -> Self {
        self.view = Some(view);
        self.view_score = Some(score);
        self
    }

    /// Stand-in outcome for a call that timed out or failed in transport.
    pub fn transport_failure() -> Self {
        Self::rejected(RejectReason::ApiError)
    }
}

#[async_trait]
pub trait VerifierBackend: Send + Sync {
    async fn verify(&self, crop: ImageCrop, target_description: &str) -> Result<VerifierOutcome>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextReading {
    pub text: String,
    pub confidence: f32,
}

#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, crop: ImageCrop) -> Result<Option<TextReading>>;
}

pub trait DepthProvider: Send {
    /// Distance in meters at a normalized image point.
    fn depth_at(&mut self, x: f32, y: f32) -> Option<f32>;
}

/// Receives one report per frame. Never mutates pipeline state.
pub trait CueSink: Send {
    fn emit(&mut self, report: &FrameReport);
}
