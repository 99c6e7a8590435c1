// src/pipeline/frame_context.rs
//
// Single source of truth for one frame's detections. Drift repair and the
// lifecycle manager both need detection embeddings; the context computes
// each one at most once per frame.

use std::collections::HashMap;
use tracing::debug;

use crate::capabilities::Embedder;
use crate::types::{Detection, Embedding, Frame};

#[derive(Debug, Clone)]
pub struct FrameContext {
    pub frame: Frame,
    pub detections: Vec<Detection>,
    /// False when the detector failed this frame
    pub detections_valid: bool,
    /// Detection index -> embedding (`None` = embedding failed)
    embedding_cache: HashMap<usize, Option<Embedding>>,
}

impl FrameContext {
    pub fn new(frame: Frame, detections: Vec<Detection>) -> Self {
        Self {
            frame,
            detections,
            detections_valid: true,
            embedding_cache: HashMap::new(),
        }
    }

    /// Context for a frame where the detector produced nothing usable.
    pub fn without_detections(frame: Frame) -> Self {
        Self {
            detections_valid: false,
            ..Self::new(frame, Vec::new())
        }
    }

    pub fn frame_id(&self) -> u64 {
        self.frame.frame_id
    }

    pub fn timestamp_ms(&self) -> f64 {
        self.frame.timestamp_ms
    }

    /// Embedding of detection `idx`, computed on first request.
    pub fn detection_embedding(&mut self, idx: usize, embedder: &dyn Embedder) -> Option<Embedding> {
        if let Some(cached) = self.embedding_cache.get(&idx) {
            return cached.clone();
        }
        let computed = self
            .detections
            .get(idx)
            .and_then(|det| self.frame.crop(&det.bbox))
            .and_then(|crop| match embedder.embed(&crop) {
                Ok(e) => Some(e),
                Err(e) => {
                    debug!("Embedding failed for detection {}: {}", idx, e);
                    None
                }
            });
        self.embedding_cache.insert(idx, computed.clone());
        computed
    }

    pub fn cached_embeddings(&self) -> usize {
        self.embedding_cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BBox, ImageCrop};
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    impl Embedder for CountingEmbedder {
        fn embed(&self, crop: &ImageCrop) -> anyhow::Result<Embedding> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Embedding(vec![crop.source.x, crop.source.y]))
        }
    }

    #[test]
    fn test_embedding_computed_once_per_detection() {
        let frame = Frame::new(1, 0.0, RgbImage::new(64, 64));
        let dets = vec![
            Detection::new(BBox::new(0.1, 0.1, 0.2, 0.2), "car", 0.9),
            Detection::new(BBox::new(0.5, 0.5, 0.2, 0.2), "car", 0.9),
        ];
        let mut ctx = FrameContext::new(frame, dets);
        let embedder = CountingEmbedder {
            calls: AtomicUsize::new(0),
        };

        let a = ctx.detection_embedding(0, &embedder);
        let again = ctx.detection_embedding(0, &embedder);
        assert_eq!(a, again);
        ctx.detection_embedding(1, &embedder);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.cached_embeddings(), 2);
    }

    #[test]
    fn test_out_of_range_detection_has_no_embedding() {
        let frame = Frame::new(1, 0.0, RgbImage::new(64, 64));
        let mut ctx = FrameContext::new(frame, Vec::new());
        let embedder = CountingEmbedder {
            calls: AtomicUsize::new(0),
        };
        assert!(ctx.detection_embedding(3, &embedder).is_none());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }
}
