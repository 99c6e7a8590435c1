// src/types.rs
//
// Geometry and frame primitives shared by every pipeline stage.
// All boxes live in normalized [0, 1] image coordinates.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Boxes narrower or shorter than this (normalized) are treated as degenerate.
const MIN_BOX_SIDE: f32 = 1e-3;

// ============================================================================
// BOUNDING BOX
// ============================================================================

/// Normalized rectangle in TLWH form (top-left x, top-left y, width, height).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from corner form (x1, y1, x2, y2).
    pub fn from_tlbr(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn to_tlbr(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width * 0.5, self.y + self.height * 0.5)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// True when every coordinate is finite and both sides are non-degenerate.
    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
            && self.width >= MIN_BOX_SIDE
            && self.height >= MIN_BOX_SIDE
    }

    /// Clip to the unit square. Returns `None` if nothing usable is left.
    pub fn clamped(&self) -> Option<BBox> {
        let [x1, y1, x2, y2] = self.to_tlbr();
        let clipped = BBox::from_tlbr(
            x1.clamp(0.0, 1.0),
            y1.clamp(0.0, 1.0),
            x2.clamp(0.0, 1.0),
            y2.clamp(0.0, 1.0),
        );
        clipped.is_valid().then_some(clipped)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let [ax1, ay1, ax2, ay2] = self.to_tlbr();
        let [bx1, by1, bx2, by2] = other.to_tlbr();

        let inter_w = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
        let inter_h = (ay2.min(by2) - ay1.max(by1)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Euclidean distance between the two box centers, in normalized units.
    pub fn center_distance(&self, other: &BBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    /// Pixel rectangle (x, y, w, h) inside a `frame_w` x `frame_h` image.
    /// Always at least 1x1 and fully inside the image.
    pub fn to_pixels(&self, frame_w: u32, frame_h: u32) -> (u32, u32, u32, u32) {
        let fw = frame_w as f32;
        let fh = frame_h as f32;
        let [x1, y1, x2, y2] = self.to_tlbr();

        let px1 = (x1.clamp(0.0, 1.0) * fw).floor() as u32;
        let py1 = (y1.clamp(0.0, 1.0) * fh).floor() as u32;
        let px2 = (x2.clamp(0.0, 1.0) * fw).ceil() as u32;
        let py2 = (y2.clamp(0.0, 1.0) * fh).ceil() as u32;

        let px1 = px1.min(frame_w.saturating_sub(1));
        let py1 = py1.min(frame_h.saturating_sub(1));
        let w = px2.saturating_sub(px1).max(1).min(frame_w - px1);
        let h = py2.saturating_sub(py1).max(1).min(frame_h - py1);
        (px1, py1, w, h)
    }
}

// ============================================================================
// FRAMES AND CROPS
// ============================================================================

/// One camera frame. The pixel buffer is shared so crops and async tasks
/// can hold on to it without copying.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(frame_id: u64, timestamp_ms: f64, image: RgbImage) -> Self {
        Self {
            frame_id,
            timestamp_ms,
            image: Arc::new(image),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Cut `bbox` out of the frame. Returns `None` for an empty image or an
    /// unusable box.
    pub fn crop(&self, bbox: &BBox) -> Option<ImageCrop> {
        if self.width() == 0 || self.height() == 0 {
            return None;
        }
        let bbox = bbox.clamped()?;
        let (x, y, w, h) = bbox.to_pixels(self.width(), self.height());
        let pixels = image::imageops::crop_imm(self.image.as_ref(), x, y, w, h).to_image();
        Some(ImageCrop {
            image: pixels,
            source: bbox,
            frame_id: self.frame_id,
        })
    }

    /// Width and height of `bbox` in pixels of this frame.
    pub fn pixel_size(&self, bbox: &BBox) -> (f32, f32) {
        (
            bbox.width * self.width() as f32,
            bbox.height * self.height() as f32,
        )
    }
}

/// Pixels of a single candidate region, detached from the frame.
#[derive(Debug, Clone)]
pub struct ImageCrop {
    pub image: RgbImage,
    /// Box the crop was taken from.
    pub source: BBox,
    pub frame_id: u64,
}

// ============================================================================
// DETECTIONS AND EMBEDDINGS
// ============================================================================

/// Raw detector output for one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub label: String,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BBox, label: impl Into<String>, confidence: f32) -> Self {
        Self {
            bbox,
            label: label.into(),
            confidence,
        }
    }
}

/// Fixed-size visual feature vector. Used for similarity, never identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    /// Cosine similarity clipped to [0, 1]. Mismatched or zero vectors score 0.
    pub fn cosine(&self, other: &Embedding) -> f32 {
        if self.0.len() != other.0.len() || self.0.is_empty() {
            return 0.0;
        }
        let dot: f32 = self.0.iter().zip(&other.0).map(|(a, b)| a * b).sum();
        let na: f32 = self.0.iter().map(|a| a * a).sum::<f32>().sqrt();
        let nb: f32 = other.0.iter().map(|b| b * b).sum::<f32>().sqrt();
        if na <= f32::EPSILON || nb <= f32::EPSILON {
            return 0.0;
        }
        (dot / (na * nb)).clamp(0.0, 1.0)
    }
}
