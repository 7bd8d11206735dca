use facemesh_utils::decode_image;
use image::{DynamicImage, RgbImage};

use crate::error::FaceMeshError;

/// Channel order of a raw pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
    /// Typical camera frame layout on desktop platforms.
    Bgra8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
        }
    }
}

/// Tightly packed raw pixels, e.g. a camera frame.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
        }
    }

    /// Convert to RGB, consuming the buffer. `Rgb8` input is reused without copying.
    pub fn into_rgb(self) -> Result<RgbImage, FaceMeshError> {
        let expected = self.width as usize * self.height as usize * self.format.bytes_per_pixel();
        if self.data.len() != expected || expected == 0 {
            return Err(FaceMeshError::Decode(format!(
                "{:?} buffer of {}x{} needs {} bytes, got {}",
                self.format,
                self.width,
                self.height,
                expected,
                self.data.len()
            )));
        }

        let rgb = match self.format {
            PixelFormat::Rgb8 => self.data,
            PixelFormat::Rgba8 => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
            PixelFormat::Bgra8 => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
        };
        RgbImage::from_raw(self.width, self.height, rgb)
            .ok_or_else(|| FaceMeshError::Decode("pixel buffer does not fit its dimensions".into()))
    }
}

/// Decode encoded image bytes (PNG, JPEG) into RGB.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, FaceMeshError> {
    decode_image(bytes)
        .map(DynamicImage::into_rgb8)
        .map_err(|e| FaceMeshError::Decode(format!("{e:#}")))
}
