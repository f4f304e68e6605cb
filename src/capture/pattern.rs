//! Synthetic frame source producing moving colour bars

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::capture::{Frame, FrameSource};
use crate::error::SourceError;
use crate::pipeline::TextureSurface;

const BARS: [[u8; 4]; 8] = [
    [255, 255, 255, 255],
    [255, 255, 0, 255],
    [0, 255, 255, 255],
    [0, 255, 0, 255],
    [255, 0, 255, 255],
    [255, 0, 0, 255],
    [0, 0, 255, 255],
    [0, 0, 0, 255],
];

/// Test-pattern source driven by a tokio interval
pub struct PatternSource {
    runtime: Handle,
    width: u32,
    height: u32,
    fps: u32,
    task: Option<JoinHandle<()>>,
}

impl PatternSource {
    pub fn new(runtime: Handle, width: u32, height: u32, fps: u32) -> Self {
        Self {
            runtime,
            width,
            height,
            fps: fps.max(1),
            task: None,
        }
    }

    /// Render frame `sequence`; the bars scroll one column per frame
    pub fn render(sequence: u64, width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        let bar_width = (width / BARS.len() as u32).max(1);
        for _ in 0..height {
            for x in 0..width {
                let shifted = (x as u64 + sequence) % width.max(1) as u64;
                let bar = ((shifted as u32 / bar_width) as usize).min(BARS.len() - 1);
                data.extend_from_slice(&BARS[bar]);
            }
        }
        Frame::rgba(sequence, width, height, data)
    }
}

impl FrameSource for PatternSource {
    fn name(&self) -> &str {
        "pattern"
    }

    #[instrument(skip(self, target), fields(width = self.width, height = self.height, fps = self.fps))]
    fn open(&mut self, target: Arc<TextureSurface>) -> Result<(), SourceError> {
        if self.task.is_some() {
            return Err(SourceError::AlreadyOpen(self.name().to_string()));
        }

        let (width, height) = (self.width, self.height);
        let period = Duration::from_secs(1) / self.fps;

        let task = self.runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut sequence = 0u64;
            loop {
                interval.tick().await;
                sequence += 1;
                if !target.publish(Self::render(sequence, width, height)) {
                    debug!("Frame listener detached, pattern source idling");
                }
            }
        });

        self.task = Some(task);
        info!("Pattern source opened");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Pattern source closed");
        }
    }

    fn is_open(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for PatternSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bars_scroll_with_sequence() {
        let first = PatternSource::render(0, 16, 1);
        let next = PatternSource::render(1, 16, 1);
        assert_eq!(first.data.len(), 16 * 4);
        // column 1 of frame 0 shows what column 0 shows in frame 1
        assert_eq!(&first.data[4..8], &next.data[0..4]);
        assert_eq!(&first.data[0..4], &BARS[0]);
    }

    #[tokio::test]
    async fn publishes_into_surface_until_closed() {
        let surface = TextureSurface::new();
        let _wake = surface.attach();
        let mut source = PatternSource::new(Handle::current(), 8, 2, 200);

        source.open(surface.clone()).unwrap();
        assert!(source.is_open());
        assert!(matches!(
            source.open(surface.clone()),
            Err(SourceError::AlreadyOpen(_))
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        source.close();
        assert!(!source.is_open());

        let produced = surface.stats().produced;
        assert!(produced > 0);
        assert!(surface.is_pending());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(surface.stats().produced, produced);
    }
}
