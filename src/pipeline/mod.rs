pub mod encode;
pub mod orchestrator;
pub mod router;
pub mod session;
pub mod texture;

pub use encode::{
    BufferIndex, EncodeFormat, EncodedSample, EncoderOutput, Muxer, TrackFormat, TrackIndex,
    VideoEncoder,
};
pub use orchestrator::{Orchestrator, OrchestratorState};
pub use router::{DrawOutcome, DualSurfaceRouter, RenderTarget, TargetKind, TickReport};
pub use session::{DrainEnd, DrainReport, DrainStats, EncodeSession, SessionState};
pub use texture::{SurfaceStats, TextureStage, TextureSurface};
