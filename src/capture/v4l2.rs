//! V4L2 camera source with memory-mapped streaming

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::decoder::decode_frame;
use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::FrameSource;
use crate::error::SourceError;
use crate::pipeline::TextureSurface;
use crate::CaptureConfig;

/// Camera source; frames are decoded to RGBA on a blocking worker
pub struct V4l2Source {
    runtime: Handle,
    config: CaptureConfig,
    /// Run flag of the current capture loop; each open gets its own
    running: Option<Arc<AtomicBool>>,
    task: Option<JoinHandle<()>>,
}

/// Negotiated capture format
#[derive(Debug, Clone, Copy)]
struct Negotiated {
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl V4l2Source {
    pub fn new(runtime: Handle, config: CaptureConfig) -> Self {
        Self {
            runtime,
            config,
            running: None,
            task: None,
        }
    }

    /// Fresh run flag for a new capture loop
    fn arm(&mut self) -> Arc<AtomicBool> {
        let running = Arc::new(AtomicBool::new(true));
        self.running = Some(running.clone());
        running
    }

    /// Open the device and apply the requested format
    fn prepare(&self) -> Result<(Device, Negotiated), SourceError> {
        let path = &self.config.device.path;
        let access = |e: std::io::Error| SourceError::Access(format!("{}: {}", path, e));

        let device = Device::with_path(path).map_err(access)?;
        let caps = device.query_caps().map_err(access)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(SourceError::Access(format!(
                "{}: device doesn't support video capture",
                path
            )));
        }

        let mut fmt = device.format().map_err(access)?;
        fmt.width = self.config.width;
        fmt.height = self.config.height;
        fmt.fourcc = match self.config.device.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            other => {
                return Err(SourceError::Access(format!(
                    "{}: unsupported capture format {:?}",
                    path, other
                )))
            }
        };

        let actual = device.set_format(&fmt).map_err(access)?;
        if actual.width != self.config.width || actual.height != self.config.height {
            warn!(
                "Requested {}x{}, device negotiated {}x{}",
                self.config.width, self.config.height, actual.width, actual.height
            );
        }

        Ok((
            device,
            Negotiated {
                width: actual.width,
                height: actual.height,
                format: self.config.device.format,
            },
        ))
    }

    /// Blocking capture loop; exits once `running` is cleared
    fn capture_loop(
        device: Device,
        negotiated: Negotiated,
        buffer_count: u32,
        running: Arc<AtomicBool>,
        target: Arc<TextureSurface>,
    ) {
        let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, buffer_count) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start capture stream: {}", e);
                running.store(false, Ordering::Release);
                return;
            }
        };
        info!("Capture stream started with {} buffers", buffer_count);

        let mut sequence = 0u64;
        while running.load(Ordering::Acquire) {
            let (buf, meta) = match stream.next() {
                Ok(next) => next,
                Err(e) => {
                    error!("Capture failed: {}", e);
                    break;
                }
            };
            let timestamp = Instant::now();

            let pixels = match decode_frame(buf, negotiated.format, negotiated.width, negotiated.height) {
                Ok(pixels) => pixels,
                Err(e) => {
                    debug!("Dropping undecodable frame: {}", e);
                    continue;
                }
            };

            sequence += 1;
            let frame = Frame {
                data: Bytes::from(pixels),
                meta: Arc::new(FrameMetadata {
                    sequence,
                    width: negotiated.width,
                    height: negotiated.height,
                    stride: negotiated.width * 4,
                    format: PixelFormat::Rgba8,
                    device_timestamp: Some(
                        Duration::from_secs(meta.timestamp.sec as u64)
                            + Duration::from_micros(meta.timestamp.usec as u64),
                    ),
                }),
                timestamp,
            };
            target.publish(frame);
        }

        running.store(false, Ordering::Release);
        info!("Capture stream stopped after {} frames", sequence);
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.config.device.path
    }

    #[instrument(skip(self, target), fields(device = %self.config.device.path))]
    fn open(&mut self, target: Arc<TextureSurface>) -> Result<(), SourceError> {
        if self.task.is_some() {
            return Err(SourceError::AlreadyOpen(self.name().to_string()));
        }

        let (device, negotiated) = self.prepare()?;
        info!("Capture opened: {:?}", negotiated);

        let running = self.arm();
        let buffer_count = self.config.buffer_count;
        self.task = Some(self.runtime.spawn_blocking(move || {
            Self::capture_loop(device, negotiated, buffer_count, running, target)
        }));
        Ok(())
    }

    fn close(&mut self) {
        if let Some(running) = self.running.take() {
            running.store(false, Ordering::Release);
        }
        // The worker exits after its current dequeue returns
        if self.task.take().is_some() {
            info!("Capture closed: {}", self.config.device.path);
        }
    }

    fn is_open(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CaptureDevice, Config};

    #[tokio::test]
    async fn missing_device_is_an_access_error() {
        let mut config = Config::default().capture;
        config.device = CaptureDevice::new("/dev/video-missing".into(), PixelFormat::Mjpeg);
        let mut source = V4l2Source::new(Handle::current(), config);

        let result = source.open(TextureSurface::new());
        assert!(matches!(result, Err(SourceError::Access(_))));
        assert!(!source.is_open());
    }

    #[tokio::test]
    async fn reopen_does_not_revive_the_closed_loop() {
        let mut source = V4l2Source::new(Handle::current(), Config::default().capture);

        let first = source.arm();
        source.close();
        let second = source.arm();

        assert!(!first.load(Ordering::Acquire));
        assert!(second.load(Ordering::Acquire));
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
