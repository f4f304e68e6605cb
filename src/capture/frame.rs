use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame image handle with zero-copy semantics
///
/// Cloning only bumps reference counts, so the same image can be handed to
/// several render targets within one tick.
#[derive(Clone)]
pub struct Frame {
    /// Immutable RGBA pixels - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgba8,
    Rgb24,
    Yuyv4,
    Mjpeg,
}

impl Frame {
    /// Wrap tightly packed RGBA pixels
    pub fn rgba(sequence: u64, width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                stride: width * 4,
                format: PixelFormat::Rgba8,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// True when both handles refer to the same underlying image
    pub fn same_image(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.meta, &other.meta)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_image() {
        let frame = Frame::rgba(3, 2, 2, vec![0u8; 16]);
        let copy = frame.clone();
        assert!(frame.same_image(&copy));
        assert_eq!(copy.sequence(), 3);
        assert_eq!(copy.meta.stride, 8);

        let other = Frame::rgba(3, 2, 2, vec![0u8; 16]);
        assert!(!frame.same_image(&other));
    }
}
