use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage, imageops::FilterType};
use ndarray::ArrayViewMut3;

use crate::config::TensorLayout;

/// Decode an encoded image (PNG, JPEG) held in memory.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    anyhow::ensure!(!bytes.is_empty(), "image buffer is empty");
    image::load_from_memory(bytes).context("failed to decode image bytes")
}

/// Resize an image to the requested resolution using the provided filter.
pub fn resize_image(image: &RgbImage, width: u32, height: u32, filter: FilterType) -> RgbImage {
    image::imageops::resize(image, width, height, filter)
}

/// Write an RGB image into a pre-allocated `f32` tensor, mapping `0..=255` linearly onto `range`.
///
/// `out` must hold exactly `3 * width * height` values; it is overwritten in place so callers can
/// keep one buffer alive for the lifetime of a model instance.
pub fn fill_tensor(
    image: &RgbImage,
    layout: TensorLayout,
    range: (f32, f32),
    out: &mut [f32],
) -> Result<()> {
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    anyhow::ensure!(
        out.len() == 3 * w * h,
        "tensor buffer holds {} values, image needs {}",
        out.len(),
        3 * w * h
    );

    let (low, high) = range;
    let scale = (high - low) / 255.0;
    match layout {
        TensorLayout::Nhwc => {
            let mut view = ArrayViewMut3::from_shape((h, w, 3), out)
                .context("tensor buffer is not contiguous")?;
            for (x, y, pixel) in image.enumerate_pixels() {
                for c in 0..3 {
                    view[(y as usize, x as usize, c)] = f32::from(pixel[c]).mul_add(scale, low);
                }
            }
        }
        TensorLayout::Nchw => {
            let mut view = ArrayViewMut3::from_shape((3, h, w), out)
                .context("tensor buffer is not contiguous")?;
            for (x, y, pixel) in image.enumerate_pixels() {
                for c in 0..3 {
                    view[(c, y as usize, x as usize)] = f32::from(pixel[c]).mul_add(scale, low);
                }
            }
        }
    }
    Ok(())
}
