//! Routing of the current frame into the preview and encode targets.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbaImage};
use tracing::{debug, info, warn};

use crate::capture::Frame;
use crate::error::SurfaceError;
use crate::pipeline::texture::TextureStage;

/// Which destination a render target feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Preview,
    Encode,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Preview => "preview",
            TargetKind::Encode => "encode",
        }
    }
}

/// A destination a frame can be drawn into.
///
/// All methods are called from the rendering context only.
pub trait RenderTarget {
    fn kind(&self) -> TargetKind;

    /// Bind this target for the draws that follow
    fn make_current(&mut self) -> Result<(), SurfaceError>;

    fn draw(&mut self, frame: &Frame) -> Result<(), SurfaceError>;

    /// Flush and present what was drawn since `make_current`
    fn present(&mut self) -> Result<(), SurfaceError>;

    /// Underlying surface size changed
    fn resize(&mut self, _width: u32, _height: u32) {}

    /// Read back the last drawn image, top row first
    fn read_pixels(&mut self) -> Option<RgbaImage> {
        None
    }
}

/// Result of one target's share of a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    /// No target registered in this slot
    Absent,
    /// Target present but nothing has been ingested yet
    NoFrame,
    Drawn,
    /// Target failed this tick and was skipped
    Skipped,
}

/// What a single rendering tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Sequence of the frame drawn into every target this tick
    pub frame: Option<u64>,
    pub ingested: bool,
    pub encode: DrawOutcome,
    pub preview: DrawOutcome,
}

struct Slot {
    target: Box<dyn RenderTarget>,
    healthy: bool,
    draws: u64,
    skips: u64,
}

impl Slot {
    fn new(target: Box<dyn RenderTarget>) -> Self {
        Self {
            target,
            healthy: true,
            draws: 0,
            skips: 0,
        }
    }
}

/// Per-target draw counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetStats {
    pub draws: u64,
    pub skips: u64,
}

/// Owns the preview and encode render targets and draws the current frame
/// into both, encode first, on every tick.
#[derive(Default)]
pub struct DualSurfaceRouter {
    preview: Option<Slot>,
    encode: Option<Slot>,
    snapshot: Option<PathBuf>,
}

impl DualSurfaceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_preview(&mut self, target: Box<dyn RenderTarget>) {
        info!("Preview target registered");
        self.preview = Some(Slot::new(target));
    }

    pub fn set_encode(&mut self, target: Box<dyn RenderTarget>) {
        info!("Encode target registered");
        self.encode = Some(Slot::new(target));
    }

    /// Unregister the encode target, e.g. before its encoder is released
    pub fn take_encode(&mut self) -> Option<Box<dyn RenderTarget>> {
        self.encode.take().map(|slot| {
            info!("Encode target unregistered");
            slot.target
        })
    }

    pub fn has_encode(&self) -> bool {
        self.encode.is_some()
    }

    pub fn resize_preview(&mut self, width: u32, height: u32) {
        if let Some(slot) = self.preview.as_mut() {
            slot.target.resize(width, height);
        }
    }

    /// Write a JPEG of the next drawn preview frame to `path`
    pub fn request_snapshot(&mut self, path: impl Into<PathBuf>) {
        self.snapshot = Some(path.into());
    }

    pub fn snapshot_pending(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn stats(&self, kind: TargetKind) -> TargetStats {
        let slot = match kind {
            TargetKind::Preview => self.preview.as_ref(),
            TargetKind::Encode => self.encode.as_ref(),
        };
        slot.map(|s| TargetStats {
            draws: s.draws,
            skips: s.skips,
        })
        .unwrap_or_default()
    }

    /// Ingest at most one pending frame, then draw it into the encode target
    /// and the preview target.
    ///
    /// The stage is only borrowed shared while drawing, so both targets are
    /// guaranteed to receive the same frame.
    pub fn tick(&mut self, stage: &mut TextureStage) -> TickReport {
        let ingested = stage.ingest();
        let mut report = self.draw_frame(stage);
        report.ingested = ingested;
        report
    }

    /// Draw the stage's current frame into both targets
    pub fn draw_frame(&mut self, stage: &TextureStage) -> TickReport {
        let started = Instant::now();

        let encode = match self.encode.as_mut() {
            Some(slot) => draw_into(slot, stage),
            None => DrawOutcome::Absent,
        };

        let preview = match self.preview.as_mut() {
            Some(slot) => draw_into_preview(slot, stage, &mut self.snapshot),
            None => DrawOutcome::Absent,
        };

        metrics::histogram!("tick_render_time_us").record(started.elapsed().as_micros() as f64);

        TickReport {
            frame: stage.current().map(Frame::sequence),
            ingested: false,
            encode,
            preview,
        }
    }
}

fn draw_into(slot: &mut Slot, stage: &TextureStage) -> DrawOutcome {
    let result = slot.target.make_current().and_then(|()| {
        let drawn = stage.render_current(slot.target.as_mut())?;
        if drawn {
            slot.target.present()?;
        }
        Ok(drawn)
    });
    settle(slot, result)
}

fn draw_into_preview(
    slot: &mut Slot,
    stage: &TextureStage,
    snapshot: &mut Option<PathBuf>,
) -> DrawOutcome {
    let result = slot.target.make_current().and_then(|()| {
        let drawn = stage.render_current(slot.target.as_mut())?;
        if drawn {
            // Readback must happen before present swaps the image away
            if let Some(path) = snapshot.take() {
                take_snapshot(slot.target.as_mut(), &path);
            }
            slot.target.present()?;
        }
        Ok(drawn)
    });
    settle(slot, result)
}

fn settle(slot: &mut Slot, result: Result<bool, SurfaceError>) -> DrawOutcome {
    let kind = slot.target.kind().as_str();
    match result {
        Ok(drawn) => {
            if !slot.healthy {
                info!(target_kind = kind, "Render target recovered");
                slot.healthy = true;
            }
            if drawn {
                slot.draws += 1;
                DrawOutcome::Drawn
            } else {
                DrawOutcome::NoFrame
            }
        }
        Err(e) => {
            if slot.healthy {
                warn!(target_kind = kind, "Skipping render target: {}", e);
                slot.healthy = false;
            } else {
                debug!(target_kind = kind, "Render target still unavailable: {}", e);
            }
            slot.skips += 1;
            DrawOutcome::Skipped
        }
    }
}

fn take_snapshot(target: &mut dyn RenderTarget, path: &Path) {
    let Some(image) = target.read_pixels() else {
        warn!("Render target does not support readback, snapshot skipped");
        return;
    };
    match save_snapshot(path, image) {
        Ok(()) => info!("Snapshot written to {}", path.display()),
        Err(e) => warn!("Failed to write snapshot {}: {}", path.display(), e),
    }
}

/// Encode `image` as a quality-100 JPEG at `path`
pub fn save_snapshot(path: &Path, image: RgbaImage) -> image::ImageResult<()> {
    let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
    let mut writer = BufWriter::new(File::create(path)?);
    JpegEncoder::new_with_quality(&mut writer, 100).encode_image(&rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    use crate::pipeline::texture::TextureSurface;

    type Log = Rc<RefCell<Vec<String>>>;

    struct Recording {
        kind: TargetKind,
        log: Log,
        fail: Rc<RefCell<bool>>,
    }

    impl RenderTarget for Recording {
        fn kind(&self) -> TargetKind {
            self.kind
        }

        fn make_current(&mut self) -> Result<(), SurfaceError> {
            if *self.fail.borrow() {
                return Err(SurfaceError::Invalidated(self.kind.as_str()));
            }
            self.log.borrow_mut().push(format!("{}:current", self.kind.as_str()));
            Ok(())
        }

        fn draw(&mut self, frame: &Frame) -> Result<(), SurfaceError> {
            self.log
                .borrow_mut()
                .push(format!("{}:draw:{}", self.kind.as_str(), frame.sequence()));
            Ok(())
        }

        fn present(&mut self) -> Result<(), SurfaceError> {
            self.log.borrow_mut().push(format!("{}:present", self.kind.as_str()));
            Ok(())
        }
    }

    fn recording(kind: TargetKind, log: &Log) -> (Box<dyn RenderTarget>, Rc<RefCell<bool>>) {
        let fail = Rc::new(RefCell::new(false));
        let target = Recording {
            kind,
            log: log.clone(),
            fail: fail.clone(),
        };
        (Box::new(target), fail)
    }

    type Fail = Rc<RefCell<bool>>;

    fn setup() -> (Arc<TextureSurface>, TextureStage, DualSurfaceRouter, Log, Fail, Fail) {
        let surface = TextureSurface::new();
        let stage = TextureStage::new(surface.clone());
        let log: Log = Rc::default();
        let mut router = DualSurfaceRouter::new();
        let (encode, encode_fail) = recording(TargetKind::Encode, &log);
        let (preview, preview_fail) = recording(TargetKind::Preview, &log);
        router.set_encode(encode);
        router.set_preview(preview);
        (surface, stage, router, log, encode_fail, preview_fail)
    }

    #[test]
    fn encode_then_preview_with_the_same_frame() {
        let (surface, mut stage, mut router, log, _, _) = setup();
        let _wake = surface.attach();
        surface.publish(Frame::rgba(7, 1, 1, vec![0u8; 4]));

        let report = router.tick(&mut stage);

        assert_eq!(report.frame, Some(7));
        assert!(report.ingested);
        assert_eq!(report.encode, DrawOutcome::Drawn);
        assert_eq!(report.preview, DrawOutcome::Drawn);
        assert_eq!(
            *log.borrow(),
            vec![
                "encode:current",
                "encode:draw:7",
                "encode:present",
                "preview:current",
                "preview:draw:7",
                "preview:present",
            ]
        );
    }

    #[test]
    fn nothing_drawn_before_first_frame() {
        let (_surface, mut stage, mut router, log, _, _) = setup();

        let report = router.tick(&mut stage);

        assert_eq!(report.frame, None);
        assert_eq!(report.encode, DrawOutcome::NoFrame);
        assert_eq!(report.preview, DrawOutcome::NoFrame);
        assert_eq!(*log.borrow(), vec!["encode:current", "preview:current"]);
    }

    #[test]
    fn invalidated_target_is_skipped_for_the_tick() {
        let (surface, mut stage, mut router, log, encode_fail, _) = setup();
        let _wake = surface.attach();
        surface.publish(Frame::rgba(1, 1, 1, vec![0u8; 4]));
        *encode_fail.borrow_mut() = true;

        let report = router.tick(&mut stage);
        assert_eq!(report.encode, DrawOutcome::Skipped);
        assert_eq!(report.preview, DrawOutcome::Drawn);
        assert_eq!(router.stats(TargetKind::Encode), TargetStats { draws: 0, skips: 1 });

        *encode_fail.borrow_mut() = false;
        log.borrow_mut().clear();
        let report = router.tick(&mut stage);
        assert!(!report.ingested);
        assert_eq!(report.encode, DrawOutcome::Drawn);
        assert_eq!(router.stats(TargetKind::Encode), TargetStats { draws: 1, skips: 1 });
        assert_eq!(router.stats(TargetKind::Preview), TargetStats { draws: 2, skips: 0 });
    }

    #[test]
    fn invalidated_preview_does_not_stall_encode() {
        let (surface, mut stage, mut router, log, _, preview_fail) = setup();
        let _wake = surface.attach();
        surface.publish(Frame::rgba(4, 1, 1, vec![0u8; 4]));
        *preview_fail.borrow_mut() = true;

        let report = router.tick(&mut stage);

        assert_eq!(report.frame, Some(4));
        assert_eq!(report.encode, DrawOutcome::Drawn);
        assert_eq!(report.preview, DrawOutcome::Skipped);
        assert_eq!(
            *log.borrow(),
            vec!["encode:current", "encode:draw:4", "encode:present"]
        );
        assert_eq!(router.stats(TargetKind::Encode), TargetStats { draws: 1, skips: 0 });
        assert_eq!(router.stats(TargetKind::Preview), TargetStats { draws: 0, skips: 1 });
    }

    #[test]
    fn missing_encode_target_is_absent() {
        let (surface, mut stage, mut router, _log, _, _) = setup();
        let _wake = surface.attach();
        assert!(router.take_encode().is_some());
        surface.publish(Frame::rgba(2, 1, 1, vec![0u8; 4]));

        let report = router.tick(&mut stage);
        assert_eq!(report.encode, DrawOutcome::Absent);
        assert_eq!(report.preview, DrawOutcome::Drawn);
    }

    #[test]
    fn snapshot_waits_for_a_drawn_preview_frame() {
        use crate::display::HeadlessPreview;

        let surface = TextureSurface::new();
        let _wake = surface.attach();
        let mut stage = TextureStage::new(surface.clone());
        let mut router = DualSurfaceRouter::new();
        router.set_preview(Box::new(HeadlessPreview::new(2, 2)));

        let path = std::env::temp_dir().join(format!("dualcast-snap-{}.jpg", std::process::id()));
        router.request_snapshot(&path);

        router.tick(&mut stage);
        assert!(router.snapshot_pending());

        surface.publish(Frame::rgba(1, 2, 2, vec![200u8; 16]));
        router.tick(&mut stage);
        assert!(!router.snapshot_pending());

        let written = image::open(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!((written.width(), written.height()), (2, 2));
    }
}
