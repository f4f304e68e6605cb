use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing::info;
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;
use crate::CaptureDevice;

/// Device path that asks for auto-detection
pub const AUTO_DEVICE: &str = "auto";

/// Auto-detect best capture device
pub fn auto_detect_device() -> Result<CaptureDevice> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        // Prefer MJPEG, fall back to YUYV
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };
        let fourccs: Vec<FourCC> = formats.iter().map(|f| f.fourcc).collect();
        if fourccs.contains(&FourCC::new(b"MJPG")) {
            info!("Found MJPEG device: {} - {}", path, caps.card);
            return Ok(CaptureDevice::new(path, PixelFormat::Mjpeg));
        }
        if fourccs.contains(&FourCC::new(b"YUYV")) {
            info!("Found YUYV device: {} - {}", path, caps.card);
            return Ok(CaptureDevice::new(path, PixelFormat::Yuyv4));
        }
    }

    Err(eyre!("No suitable capture device found"))
}

/// Resolve [`AUTO_DEVICE`] to a concrete device, keep explicit paths as-is
pub fn resolve_device(device: &CaptureDevice) -> Result<CaptureDevice> {
    if device.path == AUTO_DEVICE {
        auto_detect_device()
    } else {
        Ok(device.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_is_kept() {
        let device = CaptureDevice::new("/dev/video3".into(), PixelFormat::Yuyv4);
        assert_eq!(resolve_device(&device).unwrap(), device);
    }
}
