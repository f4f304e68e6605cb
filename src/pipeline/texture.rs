//! Single-slot frame handoff between the frame source and the renderer.
//!
//! [`TextureSurface`] is the producer side: any thread may publish into it
//! and publishing never blocks. [`TextureStage`] is the consumer side and is
//! owned by the rendering context, which is the only place frames are drawn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, trace};

use crate::capture::Frame;
use crate::error::SurfaceError;
use crate::pipeline::router::RenderTarget;

/// Latest-wins frame slot shared by a frame source and the rendering context
pub struct TextureSurface {
    /// Pending frame; `Some` means a frame-ready signal has not been consumed
    slot: ArcSwapOption<Frame>,

    /// Frame-ready listener; frames published while detached are discarded
    listener: ArcSwapOption<Sender<()>>,

    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    produced: AtomicU64,
    ingested: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of the surface counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceStats {
    pub produced: u64,
    pub ingested: u64,
    /// Frames replaced before the renderer ingested them
    pub dropped: u64,
}

impl TextureSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: ArcSwapOption::empty(),
            listener: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        })
    }

    /// Register the frame-ready listener. The returned receiver gets at most
    /// one pending wake-up, however many frames arrive before it is drained.
    pub fn attach(&self) -> Receiver<()> {
        let (tx, rx) = flume::bounded(1);
        self.listener.store(Some(Arc::new(tx)));
        debug!("Frame listener attached");
        rx
    }

    /// Unregister the listener; later frames are discarded
    pub fn detach(&self) {
        if self.listener.swap(None).is_some() {
            debug!("Frame listener detached");
        }
    }

    /// Producer: make `frame` the latest frame and signal the listener.
    ///
    /// Returns `false` if no listener is attached and the frame was discarded.
    pub fn publish(&self, frame: Frame) -> bool {
        let listener = self.listener.load_full();
        let Some(listener) = listener else {
            return false;
        };

        self.stats.produced.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_produced").increment(1);

        if let Some(replaced) = self.slot.swap(Some(Arc::new(frame))) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("frames_dropped").increment(1);
            trace!(sequence = replaced.sequence(), "Pending frame replaced");
        }

        match listener.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => trace!("Frame listener receiver dropped"),
        }
        true
    }

    pub fn is_pending(&self) -> bool {
        self.slot.load().is_some()
    }

    /// Take the pending frame, clearing the frame-ready signal
    fn take(&self) -> Option<Arc<Frame>> {
        let frame = self.slot.swap(None);
        if frame.is_some() {
            self.stats.ingested.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    pub fn stats(&self) -> SurfaceStats {
        SurfaceStats {
            produced: self.stats.produced.load(Ordering::Relaxed),
            ingested: self.stats.ingested.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Render-side holder of the current frame
pub struct TextureStage {
    surface: Arc<TextureSurface>,
    current: Option<Arc<Frame>>,
}

impl TextureStage {
    pub fn new(surface: Arc<TextureSurface>) -> Self {
        Self {
            surface,
            current: None,
        }
    }

    pub fn surface(&self) -> &Arc<TextureSurface> {
        &self.surface
    }

    /// Swap in the pending frame, if any. Returns whether the current frame
    /// changed; calling again without a new frame is a no-op.
    pub fn ingest(&mut self) -> bool {
        match self.surface.take() {
            Some(frame) => {
                trace!(sequence = frame.sequence(), "Frame ingested");
                self.current = Some(frame);
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> Option<&Frame> {
        self.current.as_deref()
    }

    /// Draw the current frame into `target`. Returns `Ok(false)` without
    /// touching the target if no frame has been ingested yet.
    pub fn render_current(&self, target: &mut dyn RenderTarget) -> Result<bool, SurfaceError> {
        match self.current.as_deref() {
            Some(frame) => {
                target.draw(frame)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::HeadlessPreview;

    fn frame(sequence: u64) -> Frame {
        Frame::rgba(sequence, 1, 1, vec![0u8; 4])
    }

    #[test]
    fn ingest_takes_only_the_latest_frame() {
        let surface = TextureSurface::new();
        let _wake = surface.attach();
        let mut stage = TextureStage::new(surface.clone());

        for seq in 1..=5 {
            assert!(surface.publish(frame(seq)));
        }

        assert!(stage.ingest());
        assert_eq!(stage.current().map(Frame::sequence), Some(5));
        assert_eq!(
            surface.stats(),
            SurfaceStats {
                produced: 5,
                ingested: 1,
                dropped: 4
            }
        );
    }

    #[test]
    fn ingest_without_new_frame_keeps_current() {
        let surface = TextureSurface::new();
        let _wake = surface.attach();
        let mut stage = TextureStage::new(surface.clone());

        assert!(!stage.ingest());
        assert!(stage.current().is_none());

        surface.publish(frame(1));
        assert!(stage.ingest());
        assert!(!stage.ingest());
        assert_eq!(stage.current().map(Frame::sequence), Some(1));
        assert!(!surface.is_pending());
    }

    #[test]
    fn detached_surface_discards_frames() {
        let surface = TextureSurface::new();
        assert!(!surface.publish(frame(1)));

        let wake = surface.attach();
        assert!(surface.publish(frame(2)));
        surface.detach();
        assert!(!surface.publish(frame(3)));

        let mut stage = TextureStage::new(surface.clone());
        assert!(stage.ingest());
        assert_eq!(stage.current().map(Frame::sequence), Some(2));
        assert_eq!(wake.try_iter().count(), 1);
    }

    #[test]
    fn wakeups_coalesce() {
        let surface = TextureSurface::new();
        let wake = surface.attach();
        for seq in 0..10 {
            surface.publish(frame(seq));
        }
        assert_eq!(wake.try_iter().count(), 1);
    }

    #[test]
    fn render_without_frame_is_silent() {
        let surface = TextureSurface::new();
        let stage = TextureStage::new(surface);
        let mut target = HeadlessPreview::new(4, 4);

        assert!(!stage.render_current(&mut target).unwrap());
        assert_eq!(target.draws(), 0);
    }

    #[test]
    fn publish_from_another_thread() {
        let surface = TextureSurface::new();
        let wake = surface.attach();
        let producer = {
            let surface = surface.clone();
            std::thread::spawn(move || {
                for seq in 1..=100 {
                    surface.publish(frame(seq));
                }
            })
        };
        producer.join().unwrap();
        wake.recv().unwrap();

        let mut stage = TextureStage::new(surface.clone());
        assert!(stage.ingest());
        assert_eq!(stage.current().map(Frame::sequence), Some(100));
    }
}
