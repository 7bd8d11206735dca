//! Rotated square crop extraction.

use image::{Rgb, RgbImage};

use crate::alignment::AlignedRoi;
use crate::error::FaceMeshError;

/// Square crop sampled from an [`AlignedRoi`]. Owned by the single call that consumes it.
#[derive(Debug, Clone)]
pub struct AlignedCrop {
    pub roi: AlignedRoi,
    pub pixels: RgbImage,
    /// Whether `pixels` has been flipped horizontally.
    pub mirrored: bool,
}

impl AlignedCrop {
    pub fn size(&self) -> u32 {
        self.pixels.width()
    }

    /// Flip horizontally, so a model trained on one side can process the other.
    pub fn mirrored(self) -> AlignedCrop {
        AlignedCrop {
            roi: self.roi,
            pixels: image::imageops::flip_horizontal(&self.pixels),
            mirrored: !self.mirrored,
        }
    }

    /// Map a point in crop pixels back to image pixels, undoing any mirror.
    pub fn project(&self, x: f32, y: f32) -> facemesh_utils::Point {
        self.roi.project(x, y, self.size() as f32, self.mirrored)
    }
}

/// Sample `roi` from `image` into an `output_size x output_size` buffer.
///
/// Backward mapping: each output pixel center is rotated into the image and sampled
/// bilinearly. Samples falling outside the image are black.
pub fn extract_aligned_crop(
    image: &RgbImage,
    roi: &AlignedRoi,
    output_size: u32,
) -> Result<AlignedCrop, FaceMeshError> {
    roi.validate()?;
    if output_size == 0 {
        return Err(FaceMeshError::Alignment("crop output size is zero".into()));
    }
    if image.width() == 0 || image.height() == 0 {
        return Err(FaceMeshError::Alignment("source image is empty".into()));
    }

    let (sin, cos) = roi.rotation.sin_cos();
    let step = roi.size / output_size as f32;
    // Continuous image coords -> pixel-center coords.
    let origin_x = roi.center.x - 0.5;
    let origin_y = roi.center.y - 0.5;

    let mut pixels = RgbImage::new(output_size, output_size);
    for (u, v, out) in pixels.enumerate_pixels_mut() {
        let dx = (u as f32 + 0.5).mul_add(step, -0.5 * roi.size);
        let dy = (v as f32 + 0.5).mul_add(step, -0.5 * roi.size);
        let sx = origin_x + dx * cos - dy * sin;
        let sy = origin_y + dx * sin + dy * cos;
        *out = sample_bilinear(image, sx, sy);
    }

    Ok(AlignedCrop {
        roi: *roi,
        pixels,
        mirrored: false,
    })
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = (image.width() as i64, image.height() as i64);
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let mut acc = [0.0f32; 3];
    for (ox, oy, weight) in [
        (0, 0, (1.0 - fx) * (1.0 - fy)),
        (1, 0, fx * (1.0 - fy)),
        (0, 1, (1.0 - fx) * fy),
        (1, 1, fx * fy),
    ] {
        let (px, py) = (x0 + ox, y0 + oy);
        if weight <= 0.0 || px < 0 || py < 0 || px >= width || py >= height {
            continue;
        }
        let pixel = image.get_pixel(px as u32, py as u32);
        for c in 0..3 {
            acc[c] = f32::from(pixel[c]).mul_add(weight, acc[c]);
        }
    }
    Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
}
