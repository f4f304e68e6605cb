//! Wires the frame source, texture stage, router and encode session together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, instrument};

use crate::capture::FrameSource;
use crate::error::PipelineError;
use crate::pipeline::encode::{EncodeFormat, Muxer, VideoEncoder};
use crate::pipeline::router::{DualSurfaceRouter, RenderTarget, TickReport};
use crate::pipeline::session::{DrainReport, EncodeSession, SessionState};
use crate::pipeline::texture::{SurfaceStats, TextureStage, TextureSurface};
use crate::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Set up, waiting for the begin trigger
    Ready,
    Recording,
    Stopped,
    /// Begin failed; the pipeline has been torn down
    Failed,
}

/// Owner of the whole pipeline. Lives on the rendering context.
pub struct Orchestrator {
    state: OrchestratorState,
    source: Box<dyn FrameSource>,
    surface: Arc<TextureSurface>,
    stage: TextureStage,
    router: DualSurfaceRouter,
    session: EncodeSession,
    wake: Receiver<()>,
    frame_budget: u32,
    snapshot_dir: PathBuf,
    snapshots: u32,
}

impl Orchestrator {
    /// Configure the encoder, register its input surface and the preview
    /// surface with the router and arm the frame-ready listener.
    #[instrument(skip_all, fields(source = source.name()))]
    pub fn setup(
        config: &Config,
        source: Box<dyn FrameSource>,
        encoder: Box<dyn VideoEncoder>,
        muxer: Box<dyn Muxer>,
        preview: Box<dyn RenderTarget>,
    ) -> Result<Self, PipelineError> {
        let mut session = EncodeSession::new(
            EncodeFormat::from(&config.encode),
            encoder,
            muxer,
            Duration::from_millis(config.encode.drain_timeout_ms),
        );

        let input_surface = session.configure().map_err(|e| {
            error!("Pipeline setup failed: {}", e);
            PipelineError::from(e)
        })?;

        let mut router = DualSurfaceRouter::new();
        router.set_encode(input_surface);
        router.set_preview(preview);

        let surface = TextureSurface::new();
        let wake = surface.attach();
        let stage = TextureStage::new(surface.clone());

        info!("Pipeline ready");
        Ok(Self {
            state: OrchestratorState::Ready,
            source,
            surface,
            stage,
            router,
            session,
            wake,
            frame_budget: config.encode.frame_budget,
            snapshot_dir: config.pipeline.snapshot_dir.clone(),
            snapshots: 0,
        })
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Open the frame source and start recording. Only the first trigger
    /// has an effect.
    #[instrument(skip(self), fields(budget = self.frame_budget))]
    pub fn begin(&mut self) -> Result<(), PipelineError> {
        if self.state != OrchestratorState::Ready {
            debug!(state = ?self.state, "Begin ignored");
            return Ok(());
        }

        if let Err(e) = self.source.open(self.surface.clone()) {
            error!("Failed to open frame source {}: {}", self.source.name(), e);
            self.abort();
            return Err(e.into());
        }

        if let Err(e) = self.session.start(self.frame_budget) {
            error!("Failed to start encode session: {}", e);
            self.abort();
            return Err(e.into());
        }

        self.state = OrchestratorState::Recording;
        info!("Recording started");
        Ok(())
    }

    /// One rendering tick: ingest the latest frame and draw it to both targets
    pub fn tick(&mut self) -> TickReport {
        self.router.tick(&mut self.stage)
    }

    /// Block until a frame-ready signal arrives or `timeout` elapses
    pub fn wait_for_frame(&self, timeout: Duration) -> bool {
        match self.wake.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Capture the next drawn preview frame as a JPEG; returns its path
    pub fn request_snapshot(&mut self) -> PathBuf {
        self.snapshots += 1;
        let path = self
            .snapshot_dir
            .join(format!("snapshot-{:04}.jpg", self.snapshots));
        self.router.request_snapshot(path.clone());
        path
    }

    pub fn resize_preview(&mut self, width: u32, height: u32) {
        self.router.resize_preview(width, height);
    }

    pub fn router(&self) -> &DualSurfaceRouter {
        &self.router
    }

    pub fn session(&self) -> &EncodeSession {
        &self.session
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn surface_stats(&self) -> SurfaceStats {
        self.surface.stats()
    }

    /// Stop frame delivery, then cancel and join the drain worker and
    /// release the encoder. Safe to call more than once.
    #[instrument(skip(self))]
    pub fn shutdown(&mut self) -> Result<Option<DrainReport>, PipelineError> {
        if matches!(
            self.state,
            OrchestratorState::Stopped | OrchestratorState::Failed
        ) {
            return Ok(None);
        }

        self.surface.detach();
        self.source.close();
        self.router.take_encode();
        self.state = OrchestratorState::Stopped;

        let report = self.session.stop().map_err(|e| {
            error!("Encode session stop failed: {}", e);
            PipelineError::from(e)
        })?;

        if let Some(report) = &report {
            info!(
                written = report.samples_written,
                discarded = report.samples_discarded,
                released = report.buffers_released,
                end = ?report.end,
                "Pipeline shut down"
            );
        }
        Ok(report)
    }

    fn abort(&mut self) {
        self.surface.detach();
        self.source.close();
        self.router.take_encode();
        if let Err(e) = self.session.stop() {
            error!("Encode session teardown failed: {}", e);
        }
        self.state = OrchestratorState::Failed;
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Pipeline teardown failed: {}", e);
        }
    }
}
