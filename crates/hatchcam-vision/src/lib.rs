pub mod camera;
pub mod diag;
pub mod doctor;
pub mod engine;
pub mod frame;
pub mod overlay;
pub mod pipeline;
pub mod sink;
#[cfg(feature = "vision-tflite")]
pub mod tflite;

use std::borrow::Cow;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use frame::Frame;

/// Axis-aligned box in absolute frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width_delta(&self) -> f32 {
        (self.x1 - self.x2).abs()
    }

    /// Keep every corner on a pixel of a `width` x `height` frame, i.e. within
    /// `0..=width-1` and `0..=height-1`, matching what the overlay draws.
    pub fn clamp_to(self, width: u32, height: u32) -> Self {
        let w = width.saturating_sub(1) as f32;
        let h = height.saturating_sub(1) as f32;
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label_id: u32,
    pub score: f32,
    pub bbox: BoundingBox,
}

/// Label id -> class name, fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
    names: Vec<String>,
}

impl LabelTable {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    /// Name for `id`, or `id:<n>` when the table has no entry.
    pub fn resolve(&self, id: u32) -> Cow<'_, str> {
        match self.get(id) {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(format!("id:{}", id)),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for LabelTable {
    fn default() -> Self {
        Self::new(default_labels())
    }
}

pub fn default_labels() -> Vec<String> {
    vec!["hatch".to_string(), "cargo".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub model_path: String,
    pub model_path_edgetpu: String,
    pub use_coral: bool,
    pub num_threads: i32,

    pub conf_threshold: f32,
    pub top_k: usize,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            model_path_edgetpu: String::new(),
            use_coral: false,
            num_threads: 2,
            conf_threshold: 0.05,
            top_k: 10,
        }
    }
}

impl VisionConfig {
    /// Model file the backend will load, honoring `use_coral`.
    pub fn active_model_path(&self) -> &str {
        if self.use_coral && !self.model_path_edgetpu.is_empty() {
            &self.model_path_edgetpu
        } else {
            &self.model_path
        }
    }
}

/// Backend seam: one forward pass, raw candidates in absolute frame pixels.
pub trait Detector: Send {
    fn name(&self) -> &'static str;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_label_table_matches_field_elements() {
        let labels = LabelTable::default();
        assert_eq!(labels.get(0), Some("hatch"));
        assert_eq!(labels.get(1), Some("cargo"));
        assert_eq!(labels.get(2), None);
        assert_eq!(labels.resolve(7), "id:7");
    }

    #[test]
    fn width_delta_ignores_corner_order() {
        let b = BoundingBox::new(50.0, 10.0, 10.0, 50.0);
        assert_eq!(b.width_delta(), 40.0);
    }

    #[test]
    fn clamp_keeps_box_inside_frame() {
        let b = BoundingBox::new(-4.0, 3.0, 400.0, 260.0).clamp_to(320, 240);
        assert_eq!(b, BoundingBox::new(0.0, 3.0, 319.0, 239.0));
        assert_eq!(BoundingBox::new(5.0, 5.0, 9.0, 9.0).clamp_to(0, 0), BoundingBox::new(0.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn coral_model_path_preferred_when_enabled() {
        let mut cfg = VisionConfig {
            model_path: "cpu.tflite".into(),
            model_path_edgetpu: "tpu.tflite".into(),
            ..VisionConfig::default()
        };
        assert_eq!(cfg.active_model_path(), "cpu.tflite");
        cfg.use_coral = true;
        assert_eq!(cfg.active_model_path(), "tpu.tflite");
    }
}
