//! SDL2 Window Preview
//! Draws routed frames into an SDL2 window canvas.

use color_eyre::{eyre::eyre, Result};
use image::RgbaImage;
use sdl2::pixels::PixelFormatEnum;
use sdl2::rect::Rect;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tracing::{debug, info};

use crate::capture::{Frame, PixelFormat};
use crate::error::SurfaceError;
use crate::pipeline::{RenderTarget, TargetKind};
use crate::DisplayConfig;

// RGBA byte order on little-endian hosts
const RGBA_BYTES: PixelFormatEnum = PixelFormatEnum::ABGR8888;

/// SDL2 preview window
pub struct SdlPreview {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    width: u32,
    height: u32,
}

impl SdlPreview {
    pub fn new(sdl_context: &sdl2::Sdl, config: &DisplayConfig) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(|e| eyre!(e))?;

        let window = video_subsystem
            .window("Dualcast Preview", config.width, config.height)
            .position_centered()
            .resizable()
            .build()?;

        let mut canvas_builder = window.into_canvas().accelerated();
        if config.vsync {
            canvas_builder = canvas_builder.present_vsync();
        }
        let canvas = canvas_builder.build()?;
        let texture_creator = canvas.texture_creator();

        info!("SDL preview window {}x{}", config.width, config.height);

        Ok(Self {
            canvas,
            texture_creator,
            width: config.width,
            height: config.height,
        })
    }

    /// Letterboxed destination keeping the frame's aspect ratio
    fn fit(&self, width: u32, height: u32) -> Rect {
        let scale = f64::min(
            self.width as f64 / width.max(1) as f64,
            self.height as f64 / height.max(1) as f64,
        );
        let w = ((width as f64 * scale) as u32).max(1);
        let h = ((height as f64 * scale) as u32).max(1);
        Rect::new(
            ((self.width - w.min(self.width)) / 2) as i32,
            ((self.height - h.min(self.height)) / 2) as i32,
            w,
            h,
        )
    }

    fn draw_error(reason: String) -> SurfaceError {
        SurfaceError::Draw {
            target: "preview",
            reason,
        }
    }
}

impl RenderTarget for SdlPreview {
    fn kind(&self) -> TargetKind {
        TargetKind::Preview
    }

    fn make_current(&mut self) -> Result<(), SurfaceError> {
        // A minimized window has no drawable surface
        let minimized = sdl2::sys::SDL_WindowFlags::SDL_WINDOW_MINIMIZED as u32;
        if self.canvas.window().window_flags() & minimized != 0 {
            return Err(SurfaceError::Invalidated("preview"));
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

        let mut texture = self
            .texture_creator
            .create_texture_streaming(RGBA_BYTES, frame.meta.width, frame.meta.height)
            .map_err(|e| Self::draw_error(e.to_string()))?;

        texture
            .update(None, &frame.data, frame.meta.stride as usize)
            .map_err(|e| Self::draw_error(e.to_string()))?;

        let dst = self.fit(frame.meta.width, frame.meta.height);
        self.canvas.clear();
        self.canvas
            .copy(&texture, None, Some(dst))
            .map_err(Self::draw_error)?;
        Ok(())
    }

    fn present(&mut self) -> Result<(), SurfaceError> {
        self.canvas.present();
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        debug!("Preview resized to {}x{}", width, height);
        self.width = width;
        self.height = height;
    }

    fn read_pixels(&mut self) -> Option<RgbaImage> {
        let pixels = self.canvas.read_pixels(None, RGBA_BYTES).ok()?;
        let (width, height) = self.canvas.output_size().ok()?;
        RgbaImage::from_raw(width, height, pixels)
    }
}
