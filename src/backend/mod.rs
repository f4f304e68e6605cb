#[cfg(feature = "gstreamer-pipeline")]
pub mod gst;

#[cfg(feature = "gstreamer-pipeline")]
pub use self::gst::{GstEncoder, GstMp4Muxer};
