//! Letterbox transform for preparing images for detector inference.
//!
//! Images are resized preserving aspect ratio and centered on a black canvas of the
//! model's input size. The recorded padding maps canvas-normalized coordinates back to
//! source-image-normalized coordinates.

use facemesh_utils::{Point, config::ResizeQuality, resize_image};
use image::{RgbImage, imageops::FilterType};

use crate::error::FaceMeshError;
use crate::postprocess::{Detection, NormalizedRect};

/// Fixed input resolution of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSize {
    /// The width of the input tensor.
    pub width: u32,
    /// The height of the input tensor.
    pub height: u32,
}

impl InputSize {
    /// Creates a new `InputSize`.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn square(edge: u32) -> Self {
        Self::new(edge, edge)
    }

    /// Values in one `H x W x 3` tensor of this size.
    pub const fn tensor_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl Default for InputSize {
    fn default() -> Self {
        Self::square(128)
    }
}

/// Resize filter for a quality preference.
pub fn resize_filter(quality: ResizeQuality) -> FilterType {
    match quality {
        ResizeQuality::Quality => FilterType::Triangle,
        ResizeQuality::Speed => FilterType::Nearest,
    }
}

/// Padding fractions of the output canvas, relative to its width (`left`, `right`)
/// or height (`top`, `bottom`).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LetterboxPadding {
    pub top: f32,
    pub bottom: f32,
    pub left: f32,
    pub right: f32,
}

impl LetterboxPadding {
    /// Padding for fitting a `src_width x src_height` image into `output`, with the
    /// resized pixel extent.
    pub fn compute(src_width: u32, src_height: u32, output: InputSize) -> (Self, u32, u32) {
        let scale = (output.width as f32 / src_width as f32)
            .min(output.height as f32 / src_height as f32);
        let new_w = ((src_width as f32 * scale).round() as u32).clamp(1, output.width);
        let new_h = ((src_height as f32 * scale).round() as u32).clamp(1, output.height);

        let pad_x = output.width - new_w;
        let pad_y = output.height - new_h;
        let left = pad_x / 2;
        let top = pad_y / 2;
        let padding = Self {
            top: top as f32 / output.height as f32,
            bottom: (pad_y - top) as f32 / output.height as f32,
            left: left as f32 / output.width as f32,
            right: (pad_x - left) as f32 / output.width as f32,
        };
        (padding, new_w, new_h)
    }

    fn content_width(&self) -> f32 {
        1.0 - self.left - self.right
    }

    fn content_height(&self) -> f32 {
        1.0 - self.top - self.bottom
    }

    /// Source-normalized point to canvas-normalized point.
    pub fn forward_point(&self, p: Point) -> Point {
        Point::new(
            p.x.mul_add(self.content_width(), self.left),
            p.y.mul_add(self.content_height(), self.top),
        )
    }

    /// Canvas-normalized point to source-normalized point.
    pub fn inverse_point(&self, p: Point) -> Point {
        Point::new(
            (p.x - self.left) / self.content_width(),
            (p.y - self.top) / self.content_height(),
        )
    }

    pub fn inverse_rect(&self, rect: &NormalizedRect) -> NormalizedRect {
        let min = self.inverse_point(Point::new(rect.xmin, rect.ymin));
        let max = self.inverse_point(Point::new(rect.xmax, rect.ymax));
        NormalizedRect::new(min.x, min.y, max.x, max.y)
    }
}

/// Letterboxed canvas plus the padding needed to undo it.
#[derive(Debug, Clone)]
pub struct Letterboxed {
    pub canvas: RgbImage,
    pub padding: LetterboxPadding,
}

/// Resize `image` into `output` preserving aspect ratio, centered with black padding.
pub fn letterbox_image(
    image: &RgbImage,
    output: InputSize,
    filter: FilterType,
) -> Result<Letterboxed, FaceMeshError> {
    let (src_w, src_h) = image.dimensions();
    if src_w == 0 || src_h == 0 {
        return Err(FaceMeshError::Decode(format!(
            "cannot letterbox an empty {src_w}x{src_h} image"
        )));
    }
    if output.width == 0 || output.height == 0 {
        return Err(FaceMeshError::Initialization(anyhow::anyhow!(
            "letterbox target {}x{} is empty",
            output.width,
            output.height
        )));
    }

    let (padding, new_w, new_h) = LetterboxPadding::compute(src_w, src_h, output);
    let left = (padding.left * output.width as f32).round() as i64;
    let top = (padding.top * output.height as f32).round() as i64;

    let mut canvas = RgbImage::new(output.width, output.height);
    if (new_w, new_h) == (src_w, src_h) {
        image::imageops::replace(&mut canvas, image, left, top);
    } else {
        let resized = resize_image(image, new_w, new_h, filter);
        image::imageops::replace(&mut canvas, &resized, left, top);
    }

    Ok(Letterboxed { canvas, padding })
}

/// Map a detection from canvas coordinates back to source-image coordinates.
pub fn unletterbox_detection(detection: &Detection, padding: &LetterboxPadding) -> Detection {
    detection.map_points(|p| padding.inverse_point(p))
}
