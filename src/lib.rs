pub mod backend;
pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
#[cfg(feature = "v4l2-capture")]
pub mod utils;

use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameSource};
pub use error::{ConfigError, EncodeError, PipelineError, SourceError, SurfaceError};
pub use pipeline::{DualSurfaceRouter, EncodeSession, Orchestrator, TextureStage, TextureSurface};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Prefix for environment overrides, e.g. `DUALCAST__ENCODE__FRAME_BUDGET=90`
const ENV_PREFIX: &str = "DUALCAST";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub encode: EncodeConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Synthetic moving colour bars
    Pattern,
    /// V4L2 camera
    V4l2,
}

/// Capture device path and its preferred pixel format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureDevice {
    pub path: String,
    pub format: PixelFormat,
}

impl CaptureDevice {
    pub fn new(path: String, format: PixelFormat) -> Self {
        Self { path, format }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub source: SourceKind,
    pub device: CaptureDevice,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

/// Fixed encode parameters and the recording budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeConfig {
    pub output_path: PathBuf,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub bit_rate: u32,
    pub frame_rate: u32,
    pub i_frame_interval_secs: u32,
    pub capture_rate: u32,
    pub repeat_previous_frame_after_us: u64,
    /// Compressed samples written to the container before the muxer stops
    pub frame_budget: u32,
    /// Upper bound on a single blocking wait for encoder output
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Rendering tick period
    pub target_latency_ms: u32,
    pub snapshot_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                source: SourceKind::Pattern,
                device: CaptureDevice::new("/dev/video0".into(), PixelFormat::Mjpeg),
                width: 1280,
                height: 720,
                fps: 30,
                buffer_count: 4,
            },
            display: DisplayConfig {
                width: 1280,
                height: 720,
                vsync: true,
            },
            encode: EncodeConfig {
                output_path: PathBuf::from("sampleCameraRecord.mp4"),
                mime: "video/avc".into(),
                width: 1280,
                height: 720,
                bit_rate: 1_250_000,
                frame_rate: 30,
                i_frame_interval_secs: 5,
                capture_rate: 30,
                repeat_previous_frame_after_us: 1_000_000 / 30,
                frame_budget: 300,
                drain_timeout_ms: 100,
            },
            pipeline: PipelineConfig {
                target_latency_ms: 33, // 30fps target
                snapshot_dir: PathBuf::from("."),
            },
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `DUALCAST__*` environment
    /// variables, in that order of precedence.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let loaded: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.width == 0 || self.capture.height == 0 || self.capture.fps == 0 {
            return Err(ConfigError::Invalid(
                "capture width, height and fps must be > 0".into(),
            ));
        }
        if self.pipeline.target_latency_ms == 0 {
            return Err(ConfigError::Invalid("target_latency_ms must be > 0".into()));
        }
        if self.encode.drain_timeout_ms == 0 {
            return Err(ConfigError::Invalid("drain_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recording_format() {
        let config = Config::default();
        assert_eq!(config.encode.width, 1280);
        assert_eq!(config.encode.height, 720);
        assert_eq!(config.encode.bit_rate, 1_250_000);
        assert_eq!(config.encode.frame_rate, 30);
        assert_eq!(config.encode.i_frame_interval_secs, 5);
        assert_eq!(config.encode.frame_budget, 300);
        assert_eq!(config.encode.repeat_previous_frame_after_us, 33_333);
        assert_eq!(config.encode.capture_rate, 30);
    }

    #[test]
    fn load_without_file_yields_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.encode.mime, "video/avc");
        assert_eq!(config.capture.source, SourceKind::Pattern);
    }

    #[test]
    fn load_reads_toml_overrides() {
        let path = std::env::temp_dir().join(format!("dualcast-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[encode]\nframe_budget = 90\noutput_path = \"clip.mp4\"\n\n[capture]\nsource = \"v4l2\"\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.encode.frame_budget, 90);
        assert_eq!(config.encode.output_path, PathBuf::from("clip.mp4"));
        assert_eq!(config.capture.source, SourceKind::V4l2);
        // untouched keys keep their defaults
        assert_eq!(config.encode.bit_rate, 1_250_000);
        assert_eq!(config.capture.device.format, PixelFormat::Mjpeg);
    }

    #[test]
    fn zero_tick_period_is_rejected() {
        let mut config = Config::default();
        config.pipeline.target_latency_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
