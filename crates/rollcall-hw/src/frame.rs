//! Frame type and pixel conversion: YUYV, GREY, Y16 and MJPG to RGB plus grayscale.

use image::{GrayImage, RgbImage};

/// A captured camera frame: colour buffer plus the grayscale used for detection.
#[derive(Clone)]
pub struct Frame {
    pub color: RgbImage,
    pub gray: GrayImage,
    pub sequence: u32,
}

impl Frame {
    /// Pair a colour buffer with a separately decoded grayscale plane.
    pub fn new(color: RgbImage, gray: GrayImage, sequence: u32) -> Self {
        Self { color, gray, sequence }
    }

    /// Build a frame from colour pixels, deriving the grayscale plane.
    pub fn from_rgb(color: RgbImage, sequence: u32) -> Self {
        let gray = image::imageops::grayscale(&color);
        Self::new(color, gray, sequence)
    }

    /// Build a frame from a monochrome sensor; the colour buffer replicates it.
    pub fn from_gray(gray: GrayImage, sequence: u32) -> Self {
        let color = image::DynamicImage::ImageLuma8(gray.clone()).to_rgb8();
        Self::new(color, gray, sequence)
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
/// Grayscale = every even-indexed byte.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(yuyv, expected)?;
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Convert packed YUYV (4:2:2) to interleaved RGB using BT.601 studio range.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(yuyv, expected)?;

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

/// Downscale 16-bit little-endian grayscale to 8 bits by keeping the high byte.
pub fn y16_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(buf, expected)?;
    Ok(buf[..expected]
        .chunks_exact(2)
        .map(|px| (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8)
        .collect())
}

/// Decode a Motion-JPEG buffer into RGB.
pub fn mjpeg_to_rgb(buf: &[u8]) -> Result<RgbImage, FrameError> {
    image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| FrameError::Decode(e.to_string()))
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| (x >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e + 128),
        clamp(298 * c - 100 * d - 208 * e + 128),
        clamp(298 * c + 516 * d + 128),
    ]
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPG decode failed: {0}")]
    Decode(String),
}
