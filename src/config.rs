// src/config.rs
//
// Pipeline configuration. Every section has working defaults so a config
// file only needs to name what it changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub target: TargetConfig,
    pub verification: VerificationConfig,
    pub drift: DriftConfig,
    pub navigation: NavigationConfig,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
    pub events: EventBusConfig,
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: PipelineConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }
}

/// What the user is looking for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Free-text description handed to the verifier backends.
    pub description: String,
    /// Expected identifying text (e.g. a plate). Enables the text pass.
    pub expected_text: Option<String>,
    /// Detector labels worth tracking.
    pub class_filter: Vec<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            description: String::new(),
            expected_text: None,
            class_filter: vec![
                "car".to_string(),
                "truck".to_string(),
                "bus".to_string(),
                "motorcycle".to_string(),
            ],
        }
    }
}

/// Thresholds for candidate bookkeeping and verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// IoU above which a detection duplicates an existing candidate
    pub duplicate_iou: f32,
    /// Normalized center distance below which a detection duplicates a candidate
    pub duplicate_center_distance: f32,
    /// IoU above which a detection counts as "seen" for miss counting
    pub overlap_iou: f32,
    /// Consecutive misses before a candidate is dropped
    pub miss_threshold: u32,
    /// Minimum time between verification batches
    pub global_interval_ms: f64,
    /// Minimum time between two attempts on the same candidate
    pub per_candidate_interval_ms: f64,
    pub max_primary_retries: u32,
    pub max_llm_retries: u32,
    /// Primary failures after which a side view escalates to the LLM early
    pub min_primary_retries: u32,
    /// Hard timeout on every backend call
    pub timeout_ms: u64,
    /// Boxes smaller than this fraction of the frame are not verified
    pub min_area_fraction: f32,
    /// Boxes taller than this multiple of their width are not verified
    pub max_height_to_width: f32,
    /// Time a rejected candidate is kept before its slot is freed
    pub reject_cooldown_ms: f64,
    pub max_edits_for_match: usize,
    pub max_edits_for_continue: usize,
    pub max_ocr_attempts: u32,
    pub ocr_interval_ms: f64,
    pub min_ocr_confidence: f32,
    /// Re-check confirmed candidates this old. `None` disables re-verification.
    pub reverify_interval_ms: Option<f64>,
    /// Upper bound on concurrently running backend calls
    pub max_in_flight: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            duplicate_iou: 0.6,
            duplicate_center_distance: 0.15,
            overlap_iou: 0.1,
            miss_threshold: 5,
            global_interval_ms: 1500.0,
            per_candidate_interval_ms: 3000.0,
            max_primary_retries: 3,
            max_llm_retries: 3,
            min_primary_retries: 1,
            timeout_ms: 5000,
            min_area_fraction: 0.01,
            max_height_to_width: 3.0,
            reject_cooldown_ms: 10_000.0,
            max_edits_for_match: 1,
            max_edits_for_continue: 3,
            max_ocr_attempts: 3,
            ocr_interval_ms: 1000.0,
            min_ocr_confidence: 0.3,
            reverify_interval_ms: None,
            max_in_flight: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Run drift repair every N frames (0 disables it)
    pub interval_frames: u64,
    /// Minimum embedding similarity to re-anchor a candidate
    pub min_similarity: f32,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            interval_frames: 15,
            min_similarity: 0.90,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Guide towards a partially matched candidate before it is confirmed
    pub navigate_before_confirmation: bool,
}

/// Optional HTTP verifier endpoints used by the replay host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub primary_url: Option<String>,
    pub llm_url: Option<String>,
    pub request_timeout_secs: u64,
    pub jpeg_quality: u8,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            primary_url: None,
            llm_url: None,
            request_timeout_secs: 10,
            jpeg_quality: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub max_pending: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { max_pending: 256 }
    }
}
