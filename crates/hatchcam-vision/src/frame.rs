use std::fmt;

use anyhow::{Context, Result};
use image::RgbImage;

pub const DEFAULT_WIDTH: u32 = 320;
pub const DEFAULT_HEIGHT: u32 = 240;
pub const CHANNELS: usize = 3;

/// Fixed-size 8-bit RGB raster, row-major.
///
/// The loop keeps exactly one of these alive and lets the camera overwrite it
/// in place, so the byte length never changes after construction.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    /// Zeroed (black) frame.
    pub fn new(width: u32, height: u32) -> Self {
        Self { image: RgbImage::new(width, height) }
    }

    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let need = byte_len(width, height);
        anyhow::ensure!(
            data.len() == need,
            "frame buffer is {} bytes, {}x{} rgb needs {}",
            data.len(), width, height, need
        );
        let image = RgbImage::from_raw(width, height, data).context("frame dimensions overflow")?;
        Ok(Self { image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn len(&self) -> usize {
        self.image.as_raw().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.image
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn same_shape(&self, other: &Frame) -> bool {
        self.image.dimensions() == other.image.dimensions()
    }

    /// Overwrite this frame with `other`'s pixels without reallocating.
    pub fn copy_from(&mut self, other: &Frame) -> Result<()> {
        anyhow::ensure!(
            self.same_shape(other),
            "frame shape mismatch: {}x{} vs {}x{}",
            self.width(), self.height(), other.width(), other.height()
        );
        self.as_bytes_mut().copy_from_slice(other.as_bytes());
        Ok(())
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        self.image.get_pixel_checked(x, y).map(|p| p.0)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish_non_exhaustive()
    }
}

pub fn byte_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * CHANNELS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_frame_is_black_and_sized() {
        let f = Frame::new(DEFAULT_WIDTH, DEFAULT_HEIGHT);
        assert_eq!(f.len(), 320 * 240 * 3);
        assert!(f.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn from_raw_rejects_wrong_length() {
        assert!(Frame::from_raw(4, 4, vec![0; 47]).is_err());
        assert!(Frame::from_raw(4, 4, vec![0; 48]).is_ok());
    }

    #[test]
    fn copy_from_requires_same_shape() {
        let mut a = Frame::new(4, 4);
        let b = Frame::from_raw(4, 4, vec![9; 48]).unwrap();
        a.copy_from(&b).unwrap();
        assert_eq!(a, b);
        assert!(a.copy_from(&Frame::new(2, 2)).is_err());
    }

    #[test]
    fn pixel_reads_rgb_triplet() {
        let mut f = Frame::new(2, 2);
        f.as_bytes_mut()[9..12].copy_from_slice(&[1, 2, 3]);
        assert_eq!(f.pixel(1, 1), Some([1, 2, 3]));
        assert_eq!(f.pixel(2, 0), None);
    }
}
