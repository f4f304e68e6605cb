//! GStreamer H.264 encoder with an appsrc input surface, and an MP4 muxer

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::{Frame, PixelFormat};
use crate::error::{EncodeError, SurfaceError};
use crate::pipeline::{
    BufferIndex, EncodeFormat, EncodedSample, EncoderOutput, Muxer, RenderTarget, TargetKind,
    TrackFormat, TrackIndex, VideoEncoder,
};

/// H.264 encoder elements, hardware first
const H264_ENCODERS: [&str; 5] = [
    "nvh264enc",    // NVIDIA
    "vaapih264enc", // Intel/AMD VAAPI
    "v4l2h264enc",  // V4L2 M2M (SoCs)
    "x264enc",
    "openh264enc",
];

fn init() -> Result<(), EncodeError> {
    gst::init().map_err(|e| EncodeError::Codec(format!("Failed to initialize GStreamer: {}", e)))
}

/// Detect the best available H.264 encoder element
fn detect_h264_encoder() -> Option<&'static str> {
    H264_ENCODERS.into_iter().find(|name| {
        let found = gst::ElementFactory::find(name).is_some();
        if found {
            debug!("Found encoder: {}", name);
        }
        found
    })
}

/// Encoder element with rate control and GOP applied
fn encoder_description(element: &str, format: &EncodeFormat) -> String {
    let kbps = (format.bit_rate / 1000).max(1);
    let gop = format.key_frame_interval_frames();
    match element {
        "x264enc" => format!(
            "x264enc bitrate={} key-int-max={} tune=zerolatency speed-preset=ultrafast",
            kbps, gop
        ),
        "vaapih264enc" => format!("vaapih264enc bitrate={} keyframe-period={}", kbps, gop),
        "nvh264enc" => format!("nvh264enc bitrate={} gop-size={}", kbps, gop),
        "openh264enc" => format!("openh264enc bitrate={} gop-size={}", format.bit_rate, gop),
        "v4l2h264enc" => format!(
            "v4l2h264enc extra-controls=\"controls,video_bitrate={},h264_i_frame_period={}\"",
            format.bit_rate, gop
        ),
        other => other.to_string(),
    }
}

fn track_format(caps: &gst::CapsRef, fallback: &EncodeFormat) -> TrackFormat {
    let structure = caps.structure(0);
    let dimension = |field: &str, default: u32| {
        structure
            .and_then(|s| s.get::<i32>(field).ok())
            .map(|v| v.max(0) as u32)
            .unwrap_or(default)
    };
    TrackFormat {
        mime: fallback.mime.clone(),
        width: dimension("width", fallback.width),
        height: dimension("height", fallback.height),
        description: caps.to_string(),
    }
}

fn clock_to_duration(time: Option<gst::ClockTime>) -> Option<Duration> {
    time.map(|t| Duration::from_nanos(t.nseconds()))
}

/// Surface-input H.264 encoder:
/// `appsrc ! videoconvert ! videoscale ! <h264 encoder> ! h264parse ! appsink`
#[derive(Default)]
pub struct GstEncoder {
    format: Option<EncodeFormat>,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
    /// Cleared when the encoder stops so the input surface reports invalidation
    accepting: Arc<AtomicBool>,
    last_caps: Option<gst::Caps>,
    /// Sample whose caps change was reported first
    stashed: Option<gst::Sample>,
    next_index: u64,
    outstanding: HashSet<u64>,
}

impl GstEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_pipeline_string(element: &str, format: &EncodeFormat) -> String {
        format!(
            "appsrc name=surface is-live=true format=time ! \
             queue max-size-buffers=4 leaky=downstream ! \
             videorate ! \
             videoconvert ! \
             videoscale ! \
             video/x-raw,format=I420,width={},height={},framerate={}/1 ! \
             {} ! \
             h264parse config-interval=-1 ! \
             video/x-h264,stream-format=byte-stream,alignment=au ! \
             appsink name=drain sync=false emit-signals=false max-buffers=64",
            format.width,
            format.height,
            format.frame_rate,
            encoder_description(element, format)
        )
    }

    fn wrap(&mut self, sample: gst::Sample) -> Result<EncoderOutput, EncodeError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| EncodeError::Codec("Encoded sample contains no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| EncodeError::Codec("Failed to map encoded buffer".into()))?;

        let index = BufferIndex(self.next_index);
        self.next_index += 1;
        self.outstanding.insert(index.0);

        Ok(EncoderOutput::Sample {
            index,
            sample: EncodedSample {
                data: Bytes::copy_from_slice(map.as_slice()),
                pts: clock_to_duration(buffer.pts()).unwrap_or_default(),
                duration: clock_to_duration(buffer.duration()),
                key_frame: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
            },
        })
    }
}

impl VideoEncoder for GstEncoder {
    fn configure(&mut self, format: &EncodeFormat) -> Result<Box<dyn RenderTarget>, EncodeError> {
        init()?;

        let element = detect_h264_encoder()
            .ok_or_else(|| EncodeError::Codec("No H.264 encoder element available".into()))?;
        info!("Using H.264 encoder: {}", element);

        let pipeline_str = Self::build_pipeline_string(element, format);
        info!("Encoder pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| EncodeError::Codec(format!("Failed to build encoder pipeline: {}", e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| EncodeError::Codec("Encoder description is not a pipeline".into()))?;

        let appsrc = pipeline
            .by_name("surface")
            .and_then(|e| e.downcast::<gst_app::AppSrc>().ok())
            .ok_or_else(|| EncodeError::Codec("Failed to find appsrc element".into()))?;
        let appsink = pipeline
            .by_name("drain")
            .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
            .ok_or_else(|| EncodeError::Codec("Failed to find appsink element".into()))?;

        self.accepting.store(true, Ordering::Release);
        let surface = GstInputSurface {
            appsrc,
            accepting: self.accepting.clone(),
            capture_rate: format.capture_rate,
            repeat_after: format.repeat_previous_frame_after,
            caps_size: None,
            started: None,
            pending: None,
            last_push: None,
        };

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        self.format = Some(format.clone());
        Ok(Box::new(surface))
    }

    fn start(&mut self) -> Result<(), EncodeError> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| EncodeError::Codec("Encoder not configured".into()))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncodeError::Codec(format!("Failed to start encoder: {:?}", e)))?;
        info!("Encoder pipeline playing");
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput, EncodeError> {
        if let Some(sample) = self.stashed.take() {
            return self.wrap(sample);
        }

        let appsink = self
            .appsink
            .as_ref()
            .ok_or_else(|| EncodeError::Codec("Encoder not configured".into()))?;

        let wait = gst::ClockTime::from_nseconds(timeout.as_nanos() as u64);
        let Some(sample) = appsink.try_pull_sample(wait) else {
            return Ok(if appsink.is_eos() {
                EncoderOutput::EndOfStream
            } else {
                EncoderOutput::TryAgainLater
            });
        };

        let changed = match (sample.caps(), self.format.as_ref()) {
            (Some(caps), Some(format)) if self.last_caps.as_deref() != Some(caps) => {
                Some((caps.to_owned(), track_format(caps, format)))
            }
            _ => None,
        };
        if let Some((caps, track)) = changed {
            self.last_caps = Some(caps);
            self.stashed = Some(sample);
            return Ok(EncoderOutput::FormatChanged(track));
        }

        self.wrap(sample)
    }

    fn release_output(&mut self, index: BufferIndex) -> Result<(), EncodeError> {
        if self.outstanding.remove(&index.0) {
            Ok(())
        } else if index.0 < self.next_index {
            Err(EncodeError::BufferAlreadyReleased(index))
        } else {
            Err(EncodeError::UnknownBuffer(index))
        }
    }

    fn stop(&mut self) -> Result<(), EncodeError> {
        self.accepting.store(false, Ordering::Release);
        if let Some(pipeline) = &self.pipeline {
            pipeline
                .set_state(gst::State::Null)
                .map_err(|e| EncodeError::Codec(format!("Failed to stop encoder: {:?}", e)))?;
        }
        if !self.outstanding.is_empty() {
            warn!(count = self.outstanding.len(), "Encoder stopped with unreleased buffers");
        }
        Ok(())
    }

    fn release(&mut self) {
        self.accepting.store(false, Ordering::Release);
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
        self.appsink = None;
        self.stashed = None;
        self.outstanding.clear();
        debug!("Encoder resources released");
    }
}

impl Drop for GstEncoder {
    fn drop(&mut self) {
        self.release();
    }
}

/// Encoder input surface: each present pushes the drawn frame into appsrc
pub struct GstInputSurface {
    appsrc: gst_app::AppSrc,
    accepting: Arc<AtomicBool>,
    /// Input caps framerate and buffer duration
    capture_rate: u32,
    repeat_after: Duration,
    caps_size: Option<(u32, u32)>,
    started: Option<Instant>,
    pending: Option<Frame>,
    last_push: Option<(Frame, Instant)>,
}

impl GstInputSurface {
    fn draw_error(reason: String) -> SurfaceError {
        SurfaceError::Draw {
            target: "encode",
            reason,
        }
    }

    fn apply_caps(&mut self, width: u32, height: u32) -> Result<(), SurfaceError> {
        if self.caps_size == Some((width, height)) {
            return Ok(());
        }
        let caps = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgba, width, height)
            .fps(gst::Fraction::new(self.capture_rate as i32, 1))
            .build()
            .map_err(|e| Self::draw_error(e.to_string()))?
            .to_caps()
            .map_err(|e| Self::draw_error(e.to_string()))?;
        self.appsrc.set_caps(Some(&caps));
        self.caps_size = Some((width, height));
        debug!("Encoder input caps set to {}x{}", width, height);
        Ok(())
    }
}

impl RenderTarget for GstInputSurface {
    fn kind(&self) -> TargetKind {
        TargetKind::Encode
    }

    fn make_current(&mut self) -> Result<(), SurfaceError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SurfaceError::Invalidated("encode"));
        }
        Ok(())
    }

    fn draw(&mut self, frame: &Frame) -> Result<(), SurfaceError> {
        if frame.meta.format != PixelFormat::Rgba8 {
            return Err(Self::draw_error(format!(
                "unsupported pixel format {:?}",
                frame.meta.format
            )));
        }
        self.apply_caps(frame.meta.width, frame.meta.height)?;
        self.pending = Some(frame.clone());
        Ok(())
    }

    fn present(&mut self) -> Result<(), SurfaceError> {
        let Some(frame) = self.pending.take() else {
            return Ok(());
        };

        let now = Instant::now();
        // The same image is only re-submitted once the repeat interval passed
        if let Some((last, at)) = &self.last_push {
            if last.same_image(&frame) && now.duration_since(*at) < self.repeat_after {
                return Ok(());
            }
        }

        let started = *self.started.get_or_insert(now);
        let mut buffer = gst::Buffer::from_slice(frame.data.clone());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(gst::ClockTime::from_nseconds(
                now.duration_since(started).as_nanos() as u64,
            ));
            buffer.set_duration(gst::ClockTime::from_nseconds(
                (Duration::from_secs(1) / self.capture_rate.max(1)).as_nanos() as u64,
            ));
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| Self::draw_error(format!("Failed to push frame: {:?}", e)))?;
        self.last_push = Some((frame, now));
        Ok(())
    }
}

/// Single-track MP4 writer: `appsrc ! h264parse ! mp4mux ! filesink`
pub struct GstMp4Muxer {
    path: PathBuf,
    caps: Option<gst::Caps>,
    pipeline: Option<gst::Pipeline>,
    appsrc: Option<gst_app::AppSrc>,
    base_pts: Option<Duration>,
}

impl GstMp4Muxer {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            caps: None,
            pipeline: None,
            appsrc: None,
            base_pts: None,
        }
    }

    fn muxer_error(context: &str, e: impl std::fmt::Display) -> EncodeError {
        EncodeError::Muxer(format!("{}: {}", context, e))
    }
}

impl Muxer for GstMp4Muxer {
    fn add_track(&mut self, format: &TrackFormat) -> Result<TrackIndex, EncodeError> {
        if self.caps.is_some() {
            return Err(EncodeError::TrackAlreadyAdded);
        }
        let caps = gst::Caps::from_str(&format.description)
            .map_err(|e| Self::muxer_error("Invalid track caps", e))?;
        info!("Adding video track {}", caps);
        self.caps = Some(caps);
        Ok(TrackIndex(0))
    }

    fn start(&mut self) -> Result<(), EncodeError> {
        let caps = self
            .caps
            .as_ref()
            .ok_or_else(|| EncodeError::Muxer("No track added".into()))?;
        init()?;

        let pipeline = gst::Pipeline::new();
        let appsrc = gst_app::AppSrc::builder()
            .name("samples")
            .caps(caps)
            .format(gst::Format::Time)
            .build();
        let parser = gst::ElementFactory::make("h264parse")
            .build()
            .map_err(|e| Self::muxer_error("Failed to create h264parse", e))?;
        let muxer = gst::ElementFactory::make("mp4mux")
            .property("faststart", true)
            .build()
            .map_err(|e| Self::muxer_error("Failed to create mp4mux", e))?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", self.path.to_string_lossy().to_string())
            .property("async", false)
            .build()
            .map_err(|e| Self::muxer_error("Failed to create filesink", e))?;

        pipeline
            .add_many([appsrc.upcast_ref(), &parser, &muxer, &filesink])
            .map_err(|e| Self::muxer_error("Failed to add elements", e))?;
        gst::Element::link_many([appsrc.upcast_ref(), &parser, &muxer, &filesink])
            .map_err(|e| Self::muxer_error("Failed to link elements", e))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| Self::muxer_error("Failed to start muxer", e))?;

        info!("MP4 muxer writing {}", self.path.display());
        self.pipeline = Some(pipeline);
        self.appsrc = Some(appsrc);
        self.base_pts = None;
        Ok(())
    }

    fn write_sample(&mut self, track: TrackIndex, sample: &EncodedSample) -> Result<(), EncodeError> {
        let appsrc = self.appsrc.as_ref().ok_or(EncodeError::MuxerNotStarted)?;
        if track != TrackIndex(0) {
            return Err(EncodeError::Muxer(format!("Unknown track {:?}", track)));
        }

        let base = *self.base_pts.get_or_insert(sample.pts);
        let mut buffer = gst::Buffer::from_slice(sample.data.clone());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(gst::ClockTime::from_nseconds(
                sample.pts.saturating_sub(base).as_nanos() as u64,
            ));
            if let Some(duration) = sample.duration {
                buffer.set_duration(gst::ClockTime::from_nseconds(duration.as_nanos() as u64));
            }
            if !sample.key_frame {
                buffer.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        appsrc
            .push_buffer(buffer)
            .map_err(|e| Self::muxer_error("Failed to push sample", format!("{:?}", e)))?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EncodeError> {
        let (Some(pipeline), Some(appsrc)) = (self.pipeline.take(), self.appsrc.take()) else {
            return Ok(());
        };

        if let Err(e) = appsrc.end_of_stream() {
            warn!("Failed to send EOS to muxer: {:?}", e);
        }

        // Wait for mp4mux to write the moov box
        let mut failure = None;
        if let Some(bus) = pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(5)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => break,
                    gst::MessageView::Error(err) => {
                        failure = Some(format!("{} ({:?})", err.error(), err.debug()));
                        break;
                    }
                    _ => {}
                }
            }
        }

        let _ = pipeline.set_state(gst::State::Null);

        if let Some(failure) = failure {
            return Err(EncodeError::Muxer(failure));
        }
        info!("MP4 muxer finalized {}", self.path.display());
        Ok(())
    }
}

impl Drop for GstMp4Muxer {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}
