//! Box overlay burned into a working copy of the frame.

use anyhow::Result;
use image::Rgb;
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::{Detection, Frame};

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Reusable rendering context; the working frame is allocated once and
/// overwritten on every call.
pub struct OverlayRenderer {
    color: Rgb<u8>,
    working: Option<Frame>,
}

impl OverlayRenderer {
    pub fn new() -> Self {
        Self::with_color(BOX_COLOR)
    }

    pub fn with_color(color: Rgb<u8>) -> Self {
        Self { color, working: None }
    }

    /// Copy `frame` and draw one unfilled rectangle per detection. The input is
    /// never touched; with no detections the result equals the input.
    pub fn render(&mut self, frame: &Frame, detections: &[Detection]) -> Result<&Frame> {
        let working = match self.working.take() {
            Some(mut w) if w.same_shape(frame) => {
                w.copy_from(frame)?;
                w
            }
            _ => frame.clone(),
        };
        let working = self.working.insert(working);

        for rect in outline_rects(detections, frame.width(), frame.height()) {
            draw_hollow_rect_mut(working.image_mut(), rect, self.color);
        }
        Ok(&*working)
    }
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// The rectangles `render` draws, one per detection, in detection order.
///
/// Corners are rounded to whole pixels and both edges are inclusive, so a box
/// (10,10,50,50) covers columns and rows 10..=50. Boxes are kept inside the frame.
pub fn outline_rects(detections: &[Detection], width: u32, height: u32) -> Vec<Rect> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let max_x = width as i32 - 1;
    let max_y = height as i32 - 1;
    detections
        .iter()
        .map(|d| {
            let b = d.bbox;
            let x1 = (b.x1.min(b.x2).round() as i32).clamp(0, max_x);
            let x2 = (b.x1.max(b.x2).round() as i32).clamp(0, max_x);
            let y1 = (b.y1.min(b.y2).round() as i32).clamp(0, max_y);
            let y2 = (b.y1.max(b.y2).round() as i32).clamp(0, max_y);
            Rect::at(x1, y1).of_size((x2 - x1 + 1) as u32, (y2 - y1 + 1) as u32)
        })
        .collect()
}
