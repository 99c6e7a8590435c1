// src/lib.rs
//
// Single-target re-identification: turns per-frame detections into
// long-lived candidates, verifies them against a target description with
// two escalating backends, and reduces everything to one phase per frame.

pub mod candidate;
pub mod capabilities;
pub mod config;
pub mod drift_repair;
pub mod lifecycle;
pub mod pipeline;
pub mod store;
pub mod types;
pub mod verification;

pub use candidate::{Candidate, CandidateId, EngineKind, MatchStatus, RejectReason, VehicleView};
pub use capabilities::{
    BoxTracker, CueSink, DepthProvider, Detector, Embedder, TextReading, TextRecognizer,
    TrackUpdate, VerifierBackend, VerifierOutcome,
};
pub use config::PipelineConfig;
pub use pipeline::{FrameReport, Phase, PipelineCoordinator, PipelineEvent};
pub use store::CandidateStore;
pub use types::{BBox, Detection, Embedding, Frame, ImageCrop};
