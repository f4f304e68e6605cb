pub mod headless;
#[cfg(feature = "sdl-preview")]
pub mod sdl;

pub use headless::HeadlessPreview;
#[cfg(feature = "sdl-preview")]
pub use sdl::SdlPreview;
