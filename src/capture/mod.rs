pub mod decoder;
pub mod frame;
pub mod pattern;
pub mod source;
#[cfg(feature = "v4l2-capture")]
pub mod v4l2;

pub use frame::Frame;
pub use frame::PixelFormat;
pub use pattern::PatternSource;
pub use source::FrameSource;
#[cfg(feature = "v4l2-capture")]
pub use v4l2::V4l2Source;
