//! Window-less preview target

use image::RgbaImage;
use tracing::trace;

use crate::capture::{Frame, PixelFormat};
use crate::error::SurfaceError;
use crate::pipeline::{RenderTarget, TargetKind};

/// Preview target that keeps the last drawn frame in memory
pub struct HeadlessPreview {
    width: u32,
    height: u32,
    last: Option<Frame>,
    draws: u64,
    presents: u64,
}

impl HeadlessPreview {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            last: None,
            draws: 0,
            presents: 0,
        }
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl RenderTarget for HeadlessPreview {
    fn kind(&self) -> TargetKind {
        TargetKind::Preview
    }

    fn make_current(&mut self) -> Result<(), SurfaceError> {
        Ok(())
    }

    fn draw(&mut self, frame: &Frame) -> Result<(), SurfaceError> {
        if frame.meta.format != PixelFormat::Rgba8 {
            return Err(SurfaceError::Draw {
                target: "preview",
                reason: format!("unsupported pixel format {:?}", frame.meta.format),
            });
        }
        self.last = Some(frame.clone());
        self.draws += 1;
        Ok(())
    }

    fn present(&mut self) -> Result<(), SurfaceError> {
        self.presents += 1;
        trace!(presents = self.presents, "Headless preview presented");
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    fn read_pixels(&mut self) -> Option<RgbaImage> {
        let frame = self.last.as_ref()?;
        RgbaImage::from_raw(frame.meta.width, frame.meta.height, frame.data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readback_returns_last_drawn_frame() {
        let mut preview = HeadlessPreview::new(2, 1);
        assert!(preview.read_pixels().is_none());

        preview
            .draw(&Frame::rgba(1, 2, 1, vec![1, 2, 3, 4, 5, 6, 7, 8]))
            .unwrap();
        let image = preview.read_pixels().unwrap();
        assert_eq!(image.get_pixel(1, 0).0, [5, 6, 7, 8]);
        assert_eq!(preview.draws(), 1);
    }

    #[test]
    fn resize_updates_size() {
        let mut preview = HeadlessPreview::new(2, 1);
        preview.resize(640, 480);
        assert_eq!(preview.size(), (640, 480));
    }
}
