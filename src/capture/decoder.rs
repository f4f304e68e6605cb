use color_eyre::{eyre::eyre, Result};
use jpeg_decoder::Decoder;

use super::frame::PixelFormat;

/// Decode a captured buffer into tightly packed RGBA
pub fn decode_frame(data: &[u8], format: PixelFormat, width: u32, height: u32) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Mjpeg => {
            let mut decoder = Decoder::new(data);
            let pixels = decoder.decode()?;
            let info = decoder
                .info()
                .ok_or_else(|| eyre!("JPEG header missing after decode"))?;
            match info.pixel_format {
                jpeg_decoder::PixelFormat::RGB24 => Ok(rgb_to_rgba(&pixels)),
                jpeg_decoder::PixelFormat::L8 => Ok(pixels.iter().flat_map(|&l| [l, l, l, 255]).collect()),
                other => Err(eyre!("Unsupported JPEG pixel format: {:?}", other)),
            }
        }
        PixelFormat::Rgb24 => Ok(rgb_to_rgba(data)),
        PixelFormat::Rgba8 => Ok(data.to_vec()),
        PixelFormat::Yuyv4 => {
            let expected = (width * height * 2) as usize;
            if data.len() < expected {
                return Err(eyre!(
                    "YUYV buffer too short: {} < {}",
                    data.len(),
                    expected
                ));
            }
            Ok(yuyv_to_rgba(&data[..expected]))
        }
    }
}

fn rgb_to_rgba(rgb: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(rgb.len() / 3 * 4);
    for chunk in rgb.chunks_exact(3) {
        rgba.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
    }
    rgba
}

// BT.601 limited range
fn yuyv_to_rgba(yuyv: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(yuyv.len() * 2);
    for px in yuyv.chunks_exact(4) {
        let (y0, u, y1, v) = (px[0], px[1], px[2], px[3]);
        for y in [y0, y1] {
            let c = y as i32 - 16;
            let d = u as i32 - 128;
            let e = v as i32 - 128;
            let r = (298 * c + 409 * e + 128) >> 8;
            let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
            let b = (298 * c + 516 * d + 128) >> 8;
            rgba.extend_from_slice(&[clamp(r), clamp(g), clamp(b), 255]);
        }
    }
    rgba
}

fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb24_gains_opaque_alpha() {
        let rgba = decode_frame(&[1, 2, 3, 4, 5, 6], PixelFormat::Rgb24, 2, 1).unwrap();
        assert_eq!(rgba, vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn yuyv_black_and_white() {
        // Y=16 is black, Y=235 is white, neutral chroma
        let rgba = decode_frame(&[16, 128, 235, 128], PixelFormat::Yuyv4, 2, 1).unwrap();
        assert_eq!(&rgba[..4], &[0, 0, 0, 255]);
        assert_eq!(&rgba[4..], &[255, 255, 255, 255]);
    }

    #[test]
    fn short_yuyv_buffer_is_rejected() {
        assert!(decode_frame(&[0; 6], PixelFormat::Yuyv4, 2, 2).is_err());
    }
}
