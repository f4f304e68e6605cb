//! Encoder and muxer boundary used by the encode session.
//!
//! Encoder events arrive as [`EncoderOutput`] messages: compressed samples,
//! format descriptions and informational status codes are distinct variants
//! rather than callbacks.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::error::EncodeError;
use crate::pipeline::router::RenderTarget;
use crate::EncodeConfig;

/// Handle of a dequeued encoder output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferIndex(pub u64);

impl fmt::Display for BufferIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Track handle returned by [`Muxer::add_track`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackIndex(pub usize);

/// How raw frames reach the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    /// Frames are drawn into an encoder-owned input surface
    Surface,
}

/// Fixed encoder configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    /// Bits per second
    pub bit_rate: u32,
    pub frame_rate: u32,
    pub i_frame_interval: Duration,
    /// Rate the input surface is fed at; resampled to `frame_rate`
    pub capture_rate: u32,
    /// Re-submit the previous frame when no new one arrived within this span
    pub repeat_previous_frame_after: Duration,
    pub color_format: ColorFormat,
}

impl EncodeFormat {
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.width == 0 || self.height == 0 {
            return Err(EncodeError::InvalidFormat(format!(
                "resolution must be > 0, got {}x{}",
                self.width, self.height
            )));
        }
        if self.frame_rate == 0 || self.capture_rate == 0 {
            return Err(EncodeError::InvalidFormat(
                "frame rate and capture rate must be > 0".into(),
            ));
        }
        if self.bit_rate == 0 {
            return Err(EncodeError::InvalidFormat("bit rate must be > 0".into()));
        }
        if self.mime.is_empty() {
            return Err(EncodeError::InvalidFormat("mime type is empty".into()));
        }
        Ok(())
    }

    /// Frames between two key frames
    pub fn key_frame_interval_frames(&self) -> u32 {
        let frames = self.i_frame_interval.as_secs_f64() * self.frame_rate as f64;
        (frames.round() as u32).max(1)
    }

    /// Nominal duration of one frame
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }
}

impl From<&EncodeConfig> for EncodeFormat {
    fn from(config: &EncodeConfig) -> Self {
        Self {
            mime: config.mime.clone(),
            width: config.width,
            height: config.height,
            bit_rate: config.bit_rate,
            frame_rate: config.frame_rate,
            i_frame_interval: Duration::from_secs(config.i_frame_interval_secs as u64),
            capture_rate: config.capture_rate,
            repeat_previous_frame_after: Duration::from_micros(
                config.repeat_previous_frame_after_us,
            ),
            color_format: ColorFormat::Surface,
        }
    }
}

/// Output format description reported by the encoder ahead of its samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    /// Backend-specific rendering of the format (e.g. GStreamer caps)
    pub description: String,
}

/// One compressed access unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSample {
    pub data: Bytes,
    pub pts: Duration,
    pub duration: Option<Duration>,
    pub key_frame: bool,
}

/// Result of one blocking wait on the encoder output queue
#[derive(Debug)]
pub enum EncoderOutput {
    /// A compressed sample held in `index` until released
    Sample {
        index: BufferIndex,
        sample: EncodedSample,
    },
    /// The format of the samples that follow
    FormatChanged(TrackFormat),
    /// Informational, no action required
    BuffersChanged,
    /// Nothing arrived within the timeout
    TryAgainLater,
    EndOfStream,
}

/// Hardware-style video encoder fed through an input surface
pub trait VideoEncoder: Send {
    /// Apply `format` and hand out the input surface frames are drawn into
    fn configure(&mut self, format: &EncodeFormat) -> Result<Box<dyn RenderTarget>, EncodeError>;

    fn start(&mut self) -> Result<(), EncodeError>;

    /// Wait up to `timeout` for the next output
    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput, EncodeError>;

    /// Return a dequeued output buffer to the encoder
    fn release_output(&mut self, index: BufferIndex) -> Result<(), EncodeError>;

    fn stop(&mut self) -> Result<(), EncodeError>;

    /// Free all encoder resources. Called once, after the drain worker exited.
    fn release(&mut self);
}

/// Container writer for a single video track
pub trait Muxer: Send {
    fn add_track(&mut self, format: &TrackFormat) -> Result<TrackIndex, EncodeError>;

    fn start(&mut self) -> Result<(), EncodeError>;

    /// Fails with [`EncodeError::MuxerNotStarted`] before `start`
    fn write_sample(&mut self, track: TrackIndex, sample: &EncodedSample) -> Result<(), EncodeError>;

    /// Finalize the container
    fn stop(&mut self) -> Result<(), EncodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    #[test]
    fn format_from_default_config() {
        let format = EncodeFormat::from(&Config::default().encode);
        assert_eq!(format.mime, "video/avc");
        assert_eq!((format.width, format.height), (1280, 720));
        assert_eq!(format.bit_rate, 1_250_000);
        assert_eq!(format.key_frame_interval_frames(), 150);
        assert_eq!(format.color_format, ColorFormat::Surface);
        assert_eq!(format.repeat_previous_frame_after, Duration::from_micros(33_333));
        assert!(format.validate().is_ok());
    }

    #[test]
    fn zero_resolution_is_invalid() {
        let mut format = EncodeFormat::from(&Config::default().encode);
        format.height = 0;
        assert!(matches!(
            format.validate(),
            Err(EncodeError::InvalidFormat(_))
        ));
    }

    #[test]
    fn zero_capture_rate_is_invalid() {
        let mut format = EncodeFormat::from(&Config::default().encode);
        format.capture_rate = 0;
        assert!(matches!(
            format.validate(),
            Err(EncodeError::InvalidFormat(_))
        ));
    }

    #[test]
    fn key_frame_interval_never_zero() {
        let mut format = EncodeFormat::from(&Config::default().encode);
        format.i_frame_interval = Duration::ZERO;
        assert_eq!(format.key_frame_interval_frames(), 1);
    }

    #[test]
    fn buffer_index_display() {
        assert_eq!(BufferIndex(12).to_string(), "#12");
    }
}
