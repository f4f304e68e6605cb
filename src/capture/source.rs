//! Frame source boundary.

use std::sync::Arc;

use crate::error::SourceError;
use crate::pipeline::TextureSurface;

/// Asynchronous producer of camera-like frames.
///
/// Once opened, the source publishes every produced frame into the target
/// [`TextureSurface`]. Publishing never blocks: a frame that is not ingested
/// before the next one arrives is simply replaced.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    /// Start producing frames into `target`
    fn open(&mut self, target: Arc<TextureSurface>) -> Result<(), SourceError>;

    /// Stop producing frames. Safe to call on a source that was never opened.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}
