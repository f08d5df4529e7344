use anyhow::Result;
use tracing::info;

use crate::{BoundingBox, Detection, Detector, Frame};

/// Wraps a loaded backend and applies threshold, ranking and the top-k cap.
pub struct InferenceEngine {
    backend: Box<dyn Detector>,
}

impl InferenceEngine {
    pub fn new(backend: Box<dyn Detector>) -> Self {
        info!("vision: engine backend = {}", backend.name());
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Detections with `score >= threshold`, best first, at most `top_k`,
    /// boxes clamped to the frame. An empty vec means nothing was found.
    pub fn detect(&mut self, frame: &Frame, threshold: f32, top_k: usize) -> Result<Vec<Detection>> {
        let raw = self.backend.detect(frame)?;
        let mut out = rank(raw, threshold, top_k);
        for d in &mut out {
            d.bbox = d.bbox.clamp_to(frame.width(), frame.height());
        }
        Ok(out)
    }
}

/// Filter to `score >= threshold`, sort by descending score (stable, so ties keep
/// backend order) and truncate to `top_k`. NaN scores never pass.
pub fn rank(mut dets: Vec<Detection>, threshold: f32, top_k: usize) -> Vec<Detection> {
    dets.retain(|d| d.score >= threshold);
    dets.sort_by(|a, b| b.score.total_cmp(&a.score));
    dets.truncate(top_k);
    dets
}

/// Aspect-preserving fit of a frame into a model input, anchored top-left with
/// the remainder padded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub input_w: u32,
    pub input_h: u32,
    /// frame pixels -> input pixels
    pub scale: f32,
    /// size of the scaled frame inside the input
    pub content_w: u32,
    pub content_h: u32,
}

impl Letterbox {
    pub fn fit(frame_w: u32, frame_h: u32, input_w: u32, input_h: u32) -> Self {
        let scale = (input_w as f32 / frame_w as f32).min(input_h as f32 / frame_h as f32);
        let content_w = ((frame_w as f32 * scale).round() as u32).clamp(1, input_w);
        let content_h = ((frame_h as f32 * scale).round() as u32).clamp(1, input_h);
        Self { input_w, input_h, scale, content_w, content_h }
    }

    /// Map a box normalized to the model input (`ymin, xmin, ymax, xmax`, the SSD
    /// postprocess order) into absolute frame pixels.
    pub fn to_frame(&self, ymin: f32, xmin: f32, ymax: f32, xmax: f32) -> BoundingBox {
        let sx = self.input_w as f32 / self.scale;
        let sy = self.input_h as f32 / self.scale;
        BoundingBox::new(xmin * sx, ymin * sy, xmax * sx, ymax * sy)
    }
}

/// Turn SSD postprocess outputs into detections in frame pixels, in backend order.
pub fn postprocess_ssd(boxes: &[f32], classes: &[f32], scores: &[f32], lb: &Letterbox) -> Vec<Detection> {
    scores
        .iter()
        .enumerate()
        .filter_map(|(i, &score)| {
            let b = boxes.get(i * 4..i * 4 + 4)?;
            let class = *classes.get(i)?;
            Some(Detection {
                label_id: class.max(0.0) as u32,
                score,
                bbox: lb.to_frame(b[0], b[1], b[2], b[3]),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(label_id: u32, score: f32) -> Detection {
        Detection { label_id, score, bbox: BoundingBox::new(1.0, 2.0, 3.0, 4.0) }
    }

    struct Fixed(Vec<Detection>);

    impl Detector for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn below_threshold_is_dropped() {
        let out = rank(vec![det(0, 0.04), det(1, 0.05), det(0, 0.5)], 0.05, 10);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| d.score >= 0.05));
    }

    #[test]
    fn nan_scores_never_pass() {
        let out = rank(vec![det(0, f32::NAN), det(1, 0.2)], 0.05, 10);
        assert_eq!(out, vec![det(1, 0.2)]);
    }

    #[test]
    fn top_k_keeps_highest_with_stable_ties() {
        // 12 candidates, all above threshold; labels record original order
        let scores = [0.3, 0.9, 0.5, 0.5, 0.1, 0.7, 0.5, 0.2, 0.8, 0.6, 0.4, 0.15];
        let raw: Vec<Detection> = scores.iter().enumerate().map(|(i, &s)| det(i as u32, s)).collect();

        let out = rank(raw, 0.05, 10);
        let ids: Vec<u32> = out.iter().map(|d| d.label_id).collect();
        assert_eq!(ids, vec![1, 8, 5, 9, 2, 3, 6, 10, 0, 7]);
    }

    #[test]
    fn engine_clamps_to_frame() {
        let mut engine = InferenceEngine::new(Box::new(Fixed(vec![Detection {
            label_id: 0,
            score: 0.9,
            bbox: BoundingBox::new(-10.0, 5.0, 500.0, 300.0),
        }])));
        let out = engine.detect(&Frame::new(320, 240), 0.05, 10).unwrap();
        assert_eq!(out[0].bbox, BoundingBox::new(0.0, 5.0, 319.0, 239.0));
    }

    #[test]
    fn engine_empty_is_not_an_error() {
        let mut engine = InferenceEngine::new(Box::new(Fixed(vec![])));
        assert!(engine.detect(&Frame::new(320, 240), 0.05, 10).unwrap().is_empty());
    }

    #[test]
    fn ssd_outputs_map_to_frame_pixels() {
        let lb = Letterbox::fit(320, 240, 300, 300);
        let boxes = [0.1, 0.25, 0.2, 0.5, 0.0, 0.0, 0.75, 1.0];
        let classes = [1.0, 0.0];
        let scores = [0.8, 0.3];
        let out = postprocess_ssd(&boxes, &classes, &scores, &lb);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].label_id, 1);
        assert!((out[0].bbox.x1 - 80.0).abs() < 1e-3);
        assert!((out[0].bbox.x2 - 160.0).abs() < 1e-3);
        assert_eq!(out[1].label_id, 0);
        assert!((out[1].bbox.y2 - 240.0).abs() < 1e-3);
    }

    #[test]
    fn ssd_short_outputs_are_truncated() {
        let lb = Letterbox::fit(320, 240, 300, 300);
        let out = postprocess_ssd(&[0.0; 4], &[0.0, 1.0], &[0.9, 0.9], &lb);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn letterbox_preserves_aspect() {
        // 320x240 into a square 300 input: width limits, 300x225 content
        let lb = Letterbox::fit(320, 240, 300, 300);
        assert_eq!((lb.content_w, lb.content_h), (300, 225));
        assert!((lb.scale - 0.9375).abs() < 1e-6);
    }

    #[test]
    fn letterbox_maps_back_to_frame_pixels() {
        let lb = Letterbox::fit(320, 240, 300, 300);
        // full content area: x spans the input, y spans 225/300 of it
        let b = lb.to_frame(0.0, 0.0, 0.75, 1.0);
        assert!((b.x2 - 320.0).abs() < 1e-3);
        assert!((b.y2 - 240.0).abs() < 1e-3);

        let b = lb.to_frame(0.1, 0.25, 0.2, 0.5);
        assert!((b.x1 - 80.0).abs() < 1e-3);
        assert!((b.y1 - 32.0).abs() < 1e-3);
    }
}
