//! Encode session: owns the encoder, the muxer and the drain worker.
//!
//! `Idle → Configured → Running → Draining → Stopped`. After `start` the
//! encoder and muxer move into a dedicated worker thread, which is their
//! only user until it is joined again in `stop`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, info, instrument, warn};

use crate::error::EncodeError;
use crate::pipeline::encode::{
    BufferIndex, EncodeFormat, EncodedSample, EncoderOutput, Muxer, TrackFormat, TrackIndex,
    VideoEncoder,
};
use crate::pipeline::router::RenderTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configured,
    Running,
    /// Budget exhausted or stop requested; encoder buffers are still drained
    Draining,
    Stopped,
}

/// Why the drain loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainEnd {
    EndOfStream,
    Cancelled,
}

/// Summary of a finished drain loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub samples_written: u64,
    pub samples_discarded: u64,
    pub buffers_released: u64,
    pub end: DrainEnd,
}

/// Live counters shared with the drain worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub samples_written: u64,
    pub samples_discarded: u64,
    pub buffers_released: u64,
    pub budget_exhausted: bool,
}

#[derive(Default)]
struct Progress {
    written: AtomicU64,
    discarded: AtomicU64,
    released: AtomicU64,
    budget_exhausted: AtomicBool,
    /// Set by the worker on exit; encoder and muxer are stopped by then
    finished: AtomicBool,
}

struct DrainWorker {
    handle: JoinHandle<Option<DrainExit>>,
    cancel: Sender<()>,
}

struct DrainExit {
    encoder: Box<dyn VideoEncoder>,
    result: Result<DrainReport, EncodeError>,
}

/// One recording: encoder, muxer and frame budget
pub struct EncodeSession {
    state: SessionState,
    format: EncodeFormat,
    drain_timeout: Duration,
    encoder: Option<Box<dyn VideoEncoder>>,
    muxer: Option<Box<dyn Muxer>>,
    worker: Option<DrainWorker>,
    progress: Arc<CachePadded<Progress>>,
}

impl std::fmt::Debug for EncodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeSession")
            .field("state", &self.state())
            .field("mime", &self.format.mime)
            .field("width", &self.format.width)
            .field("height", &self.format.height)
            .field("stats", &self.stats())
            .finish()
    }
}

impl EncodeSession {
    pub fn new(
        format: EncodeFormat,
        encoder: Box<dyn VideoEncoder>,
        muxer: Box<dyn Muxer>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            format,
            drain_timeout,
            encoder: Some(encoder),
            muxer: Some(muxer),
            worker: None,
            progress: Arc::new(CachePadded::new(Progress::default())),
        }
    }

    pub fn state(&self) -> SessionState {
        match self.state {
            SessionState::Running | SessionState::Draining
                if self.progress.finished.load(Ordering::Acquire) =>
            {
                SessionState::Stopped
            }
            SessionState::Running if self.progress.budget_exhausted.load(Ordering::Acquire) => {
                SessionState::Draining
            }
            state => state,
        }
    }

    pub fn format(&self) -> &EncodeFormat {
        &self.format
    }

    pub fn stats(&self) -> DrainStats {
        DrainStats {
            samples_written: self.progress.written.load(Ordering::Relaxed),
            samples_discarded: self.progress.discarded.load(Ordering::Relaxed),
            buffers_released: self.progress.released.load(Ordering::Relaxed),
            budget_exhausted: self.progress.budget_exhausted.load(Ordering::Acquire),
        }
    }

    /// True once the drain worker has exited on its own (end of stream or failure)
    pub fn is_finished(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| worker.handle.is_finished())
    }

    /// Configure the encoder and return its input surface
    #[instrument(skip(self), fields(mime = %self.format.mime))]
    pub fn configure(&mut self) -> Result<Box<dyn RenderTarget>, EncodeError> {
        self.expect_state("configure", SessionState::Idle)?;
        self.format.validate()?;

        let encoder = self.encoder.as_mut().ok_or(EncodeError::InvalidState {
            op: "configure",
            state: self.state,
        })?;
        let surface = encoder.configure(&self.format)?;

        info!(
            width = self.format.width,
            height = self.format.height,
            bit_rate = self.format.bit_rate,
            frame_rate = self.format.frame_rate,
            key_frame_interval = self.format.key_frame_interval_frames(),
            "Encoder configured"
        );
        self.state = SessionState::Configured;
        Ok(surface)
    }

    /// Start encoding; `frame_budget` samples are written before the muxer
    /// stops. A budget of 0 never starts the muxer.
    #[instrument(skip(self))]
    pub fn start(&mut self, frame_budget: u32) -> Result<(), EncodeError> {
        self.expect_state("start", SessionState::Configured)?;

        if self.encoder.is_none() || self.muxer.is_none() {
            return Err(EncodeError::InvalidState {
                op: "start",
                state: self.state,
            });
        }

        // The worker waits for its drainer, so a failed spawn leaves the
        // encoder and muxer with the session
        let (cancel_tx, cancel_rx) = flume::bounded(1);
        let (handoff_tx, handoff_rx) = flume::bounded::<Drainer>(1);
        let timeout = self.drain_timeout;
        let handle = std::thread::Builder::new()
            .name("encode-drain".into())
            .spawn(move || {
                let drainer = handoff_rx.recv().ok()?;
                Some(drainer.run(cancel_rx, timeout))
            })?;

        let (Some(mut encoder), Some(muxer)) = (self.encoder.take(), self.muxer.take()) else {
            return Err(EncodeError::InvalidState {
                op: "start",
                state: self.state,
            });
        };

        if let Err(e) = encoder.start() {
            drop(handoff_tx);
            let _ = handle.join();
            self.encoder = Some(encoder);
            self.muxer = Some(muxer);
            return Err(e);
        }

        if frame_budget == 0 {
            self.progress.budget_exhausted.store(true, Ordering::Release);
        }

        let drainer = Drainer {
            encoder,
            muxer,
            track: None,
            track_format: None,
            started: false,
            remaining: frame_budget,
            held: Vec::new(),
            progress: self.progress.clone(),
        };
        if let Err(flume::SendError(drainer)) = handoff_tx.send(drainer) {
            let _ = handle.join();
            let Drainer {
                mut encoder, muxer, ..
            } = drainer;
            if let Err(e) = encoder.stop() {
                error!("Failed to stop encoder: {}", e);
            }
            self.encoder = Some(encoder);
            self.muxer = Some(muxer);
            return Err(EncodeError::WorkerPanicked);
        }

        self.worker = Some(DrainWorker {
            handle,
            cancel: cancel_tx,
        });
        self.state = SessionState::Running;
        info!(frame_budget, "Encode session running");
        Ok(())
    }

    /// Cancel the drain worker, wait for it and release the encoder.
    ///
    /// Returns the drain report the first time a running session is stopped
    /// and `Ok(None)` on every later call.
    #[instrument(skip(self))]
    pub fn stop(&mut self) -> Result<Option<DrainReport>, EncodeError> {
        match self.state {
            SessionState::Stopped => {
                debug!("Encode session already stopped");
                return Ok(None);
            }
            SessionState::Idle | SessionState::Configured => {
                if let Some(mut encoder) = self.encoder.take() {
                    encoder.release();
                }
                self.muxer = None;
                self.state = SessionState::Stopped;
                info!("Encode session stopped before start");
                return Ok(None);
            }
            SessionState::Running | SessionState::Draining => {}
        }

        self.state = SessionState::Draining;
        let Some(worker) = self.worker.take() else {
            self.state = SessionState::Stopped;
            return Ok(None);
        };

        // The worker may already be gone after end of stream
        let _ = worker.cancel.try_send(());

        let exit = worker.handle.join();
        self.state = SessionState::Stopped;

        let DrainExit {
            mut encoder,
            result,
        } = exit.ok().flatten().ok_or_else(|| {
            error!("Encode drain worker panicked");
            EncodeError::WorkerPanicked
        })?;

        encoder.release();
        info!("Encoder released");

        result.map(Some)
    }

    fn expect_state(&self, op: &'static str, expected: SessionState) -> Result<(), EncodeError> {
        if self.state != expected {
            return Err(EncodeError::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }
}

impl Drop for EncodeSession {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop() {
                error!("Encode session teardown failed: {}", e);
            }
        }
    }
}

/// State owned by the drain worker thread
struct Drainer {
    encoder: Box<dyn VideoEncoder>,
    muxer: Box<dyn Muxer>,
    track: Option<TrackIndex>,
    track_format: Option<TrackFormat>,
    /// Muxer accepts samples only while this is set
    started: bool,
    remaining: u32,
    /// Samples that arrived before any format description
    held: Vec<EncodedSample>,
    progress: Arc<CachePadded<Progress>>,
}

impl Drainer {
    fn run(mut self, cancel: Receiver<()>, timeout: Duration) -> DrainExit {
        info!("Encode drain worker started");
        let pumped = self.pump(&cancel, timeout);
        if let Err(e) = &pumped {
            error!("Encode drain loop failed: {}", e);
        }

        let teardown = self.teardown();
        let result = pumped.and_then(|end| {
            teardown?;
            Ok(DrainReport {
                samples_written: self.progress.written.load(Ordering::Relaxed),
                samples_discarded: self.progress.discarded.load(Ordering::Relaxed),
                buffers_released: self.progress.released.load(Ordering::Relaxed),
                end,
            })
        });

        self.progress.finished.store(true, Ordering::Release);
        info!("Encode drain worker exited");
        DrainExit {
            encoder: self.encoder,
            result,
        }
    }

    fn pump(&mut self, cancel: &Receiver<()>, timeout: Duration) -> Result<DrainEnd, EncodeError> {
        loop {
            match cancel.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    info!("Encode drain cancelled");
                    return Ok(DrainEnd::Cancelled);
                }
                Err(TryRecvError::Empty) => {}
            }

            match self.encoder.dequeue_output(timeout)? {
                EncoderOutput::Sample { index, sample } => {
                    let handled = self.on_sample(sample);
                    // Released whether or not the sample was written
                    self.release(index)?;
                    handled?;
                }
                EncoderOutput::FormatChanged(format) => self.on_format(format)?,
                EncoderOutput::BuffersChanged => {
                    warn!("Encoder output buffers changed, ignoring");
                }
                EncoderOutput::TryAgainLater => {}
                EncoderOutput::EndOfStream => {
                    info!("Encoder signalled end of stream");
                    return Ok(DrainEnd::EndOfStream);
                }
            }
        }
    }

    fn on_format(&mut self, format: TrackFormat) -> Result<(), EncodeError> {
        if self.track_format.is_some() {
            warn!("Encoder output format changed mid-stream, ignoring: {}", format.description);
            return Ok(());
        }

        info!("Encoder output format: {}", format.description);
        self.track_format = Some(format);

        let mut held = std::mem::take(&mut self.held).into_iter();
        while let Some(sample) = held.next() {
            if let Err(e) = self.write(&sample) {
                self.discard(&sample);
                held.for_each(|rest| self.discard(&rest));
                return Err(e);
            }
        }
        Ok(())
    }

    fn on_sample(&mut self, sample: EncodedSample) -> Result<(), EncodeError> {
        if self.remaining as usize <= self.held.len() {
            self.discard(&sample);
            return Ok(());
        }

        if self.track_format.is_none() {
            debug!(pts = ?sample.pts, "Holding sample until the output format is known");
            self.held.push(sample);
            return Ok(());
        }

        self.write(&sample)
    }

    fn write(&mut self, sample: &EncodedSample) -> Result<(), EncodeError> {
        let track = self.ensure_started()?;
        self.muxer.write_sample(track, sample)?;

        self.remaining -= 1;
        self.progress.written.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("encode_samples_written").increment(1);
        debug!(
            pts = ?sample.pts,
            size = sample.data.len(),
            key_frame = sample.key_frame,
            remaining = self.remaining,
            "Sample written"
        );

        if self.remaining == 0 {
            info!("Frame budget reached, stopping muxer");
            self.muxer.stop()?;
            self.started = false;
            self.progress.budget_exhausted.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn ensure_started(&mut self) -> Result<TrackIndex, EncodeError> {
        if let (true, Some(track)) = (self.started, self.track) {
            return Ok(track);
        }

        let format = self.track_format.as_ref().ok_or(EncodeError::MuxerNotStarted)?;
        let track = match self.track {
            Some(track) => track,
            None => {
                info!("Adding video track {}", format.description);
                let track = self.muxer.add_track(format)?;
                self.track = Some(track);
                track
            }
        };

        info!("Muxer start");
        self.muxer.start()?;
        self.started = true;
        Ok(track)
    }

    fn discard(&self, sample: &EncodedSample) {
        self.progress.discarded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("encode_samples_discarded").increment(1);
        debug!(pts = ?sample.pts, "Sample over budget, discarded");
    }

    fn release(&mut self, index: BufferIndex) -> Result<(), EncodeError> {
        self.encoder.release_output(index)?;
        self.progress.released.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), EncodeError> {
        let mut first_error = None;

        if !self.held.is_empty() {
            warn!(
                count = self.held.len(),
                "Dropping samples that never received an output format"
            );
            for sample in std::mem::take(&mut self.held) {
                self.discard(&sample);
            }
        }

        if self.started {
            info!("Muxer stop");
            if let Err(e) = self.muxer.stop() {
                error!("Failed to stop muxer: {}", e);
                first_error.get_or_insert(e);
            }
            self.started = false;
        }

        info!("Stop encoder");
        if let Err(e) = self.encoder.stop() {
            error!("Failed to stop encoder: {}", e);
            first_error.get_or_insert(e);
        }

        first_error.map_or(Ok(()), Err)
    }
}
