//! Dualcast: camera frames routed to a live preview and an MP4 recording

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tokio::runtime::Handle;
use tracing::{info, warn};

use dualcast::backend::{GstEncoder, GstMp4Muxer};
use dualcast::capture::PatternSource;
use dualcast::pipeline::{OrchestratorState, RenderTarget};
use dualcast::{Config, FrameSource, Orchestrator, SourceKind};

fn build_source(config: &Config, runtime: Handle) -> Result<Box<dyn FrameSource>> {
    let capture = &config.capture;
    match capture.source {
        SourceKind::Pattern => Ok(Box::new(PatternSource::new(
            runtime,
            capture.width,
            capture.height,
            capture.fps,
        ))),
        #[cfg(feature = "v4l2-capture")]
        SourceKind::V4l2 => {
            let mut capture = capture.clone();
            capture.device = dualcast::utils::resolve_device(&capture.device)?;
            info!("Using capture device: {:?}", capture.device);
            Ok(Box::new(dualcast::capture::V4l2Source::new(runtime, capture)))
        }
        #[cfg(not(feature = "v4l2-capture"))]
        SourceKind::V4l2 => Err(color_eyre::eyre::eyre!(
            "V4L2 capture requested but the v4l2-capture feature is disabled"
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dualcast=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Dualcast launching...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    dualcast::CONFIG.store(Arc::new(config.clone()));

    let source = build_source(&config, Handle::current())?;
    let encoder = Box::new(GstEncoder::new());
    let muxer = Box::new(GstMp4Muxer::new(&config.encode.output_path));

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received");
                stop.store(true, Ordering::Release);
            }
        });
    }

    #[cfg(feature = "sdl-preview")]
    let sdl_context = sdl2::init().map_err(|e| color_eyre::eyre::eyre!(e))?;
    #[cfg(feature = "sdl-preview")]
    let preview: Box<dyn RenderTarget> =
        Box::new(dualcast::display::SdlPreview::new(&sdl_context, &config.display)?);
    #[cfg(not(feature = "sdl-preview"))]
    let preview: Box<dyn RenderTarget> = Box::new(dualcast::display::HeadlessPreview::new(
        config.display.width,
        config.display.height,
    ));

    let mut orchestrator = Orchestrator::setup(&config, source, encoder, muxer, preview)?;
    // Headless runs record from launch; with a window the user starts it
    #[cfg(not(feature = "sdl-preview"))]
    orchestrator.begin()?;
    #[cfg(feature = "sdl-preview")]
    info!("Press R to start recording, S for a snapshot, Esc to quit");

    #[cfg(feature = "sdl-preview")]
    let mut events = sdl_context.event_pump().map_err(|e| color_eyre::eyre::eyre!(e))?;

    let tick_period = Duration::from_millis(config.pipeline.target_latency_ms as u64);
    while !stop.load(Ordering::Acquire) {
        #[cfg(feature = "sdl-preview")]
        {
            use sdl2::event::{Event, WindowEvent};
            use sdl2::keyboard::Keycode;

            for event in events.poll_iter() {
                match event {
                    Event::Quit { .. }
                    | Event::KeyDown {
                        keycode: Some(Keycode::Escape),
                        ..
                    } => stop.store(true, Ordering::Release),
                    Event::KeyDown {
                        keycode: Some(Keycode::R),
                        ..
                    } => {
                        if let Err(e) = orchestrator.begin() {
                            tracing::error!("Failed to start recording: {}", e);
                            stop.store(true, Ordering::Release);
                        }
                    }
                    Event::KeyDown {
                        keycode: Some(Keycode::S),
                        ..
                    } => {
                        let path = orchestrator.request_snapshot();
                        info!("Snapshot requested: {}", path.display());
                    }
                    Event::Window {
                        win_event: WindowEvent::Resized(w, h),
                        ..
                    } => orchestrator.resize_preview(w.max(1) as u32, h.max(1) as u32),
                    _ => {}
                }
            }
        }

        orchestrator.wait_for_frame(tick_period);
        orchestrator.tick();

        // Without a window there is nothing to watch once the recording is done
        #[cfg(not(feature = "sdl-preview"))]
        if matches!(
            orchestrator.session_state(),
            dualcast::pipeline::SessionState::Draining | dualcast::pipeline::SessionState::Stopped
        ) {
            info!("Frame budget reached");
            break;
        }

        if orchestrator.session().is_finished() {
            warn!("Drain worker ended early");
            break;
        }
    }

    if orchestrator.state() == OrchestratorState::Recording {
        let stats = orchestrator.surface_stats();
        info!(
            produced = stats.produced,
            ingested = stats.ingested,
            dropped = stats.dropped,
            "Frame delivery summary"
        );
    }

    match orchestrator.shutdown()? {
        Some(report) => info!(
            "Wrote {} samples to {}",
            report.samples_written,
            config.encode.output_path.display()
        ),
        None => info!("Nothing recorded"),
    }

    info!("Dualcast shutting down");
    Ok(())
}
