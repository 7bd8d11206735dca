//! Person segmentation stage.
//!
//! The whole image is letterboxed into the model's square input. One-channel outputs
//! are person logits; six-channel outputs are per-class logits with background in
//! channel 0. The probability map is cropped back out of the padding and resampled
//! to the source resolution.

use facemesh_utils::{Point, TensorLayout, stage_span};
use image::{GrayImage, Luma, RgbImage, imageops::FilterType};
use log::Level;

use crate::error::{FaceMeshError, Stage};
use crate::model::{InferenceModel, TensorBuffer};
use crate::postprocess::sigmoid_clamped;
use crate::preprocess::{LetterboxPadding, letterbox_image};

const LOGIT_CLIP: f32 = 80.0;

/// Per-pixel person probability at source resolution, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl SegmentationMask {
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Binary mask: 255 where the probability reaches `threshold`.
    pub fn to_luma(&self, threshold: f32) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            let on = self.get(x, y).is_some_and(|p| p >= threshold);
            Luma([if on { 255 } else { 0 }])
        })
    }
}

#[derive(Debug)]
pub struct Segmenter<M> {
    model: M,
    buffer: TensorBuffer,
    filter: FilterType,
}

impl<M: InferenceModel> Segmenter<M> {
    pub fn new(model: M) -> Result<Self, FaceMeshError> {
        let spec = model.input_spec();
        if spec.size.width == 0 || spec.size.height == 0 {
            return Err(FaceMeshError::Initialization(anyhow::anyhow!(
                "segmentation model has an empty input"
            )));
        }
        Ok(Self {
            model,
            buffer: TensorBuffer::new(spec),
            filter: FilterType::Triangle,
        })
    }

    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    pub fn segment(&mut self, image: &RgbImage) -> Result<SegmentationMask, FaceMeshError> {
        let _guard = stage_span(Stage::Segmentation.as_str(), "total", Level::Debug);
        let spec = self.buffer.spec();
        let letterboxed = letterbox_image(image, spec.size, self.filter)?;
        self.buffer
            .fill(&letterboxed.canvas)
            .map_err(|e| FaceMeshError::inference(Stage::Segmentation, e))?;
        let outputs = self
            .model
            .run(&self.buffer)
            .map_err(|e| FaceMeshError::inference(Stage::Segmentation, e))?;

        let (w, h) = (spec.size.width as usize, spec.size.height as usize);
        let plane = w * h;
        let output = outputs
            .iter()
            .find(|t| t.len() == plane || t.len() == plane * 6)
            .ok_or_else(|| {
                FaceMeshError::invalid_output(
                    Stage::Segmentation,
                    format!("expected {plane} or {} values per output", plane * 6),
                )
            })?;
        let channels = output.len() / plane;
        let probabilities = person_probabilities(&output.data, channels, plane, spec.layout);

        Ok(resample(
            &probabilities,
            (w, h),
            &letterboxed.padding,
            image.dimensions(),
        ))
    }

    pub fn into_inner(self) -> M {
        self.model
    }
}

fn person_probabilities(
    data: &[f32],
    channels: usize,
    plane: usize,
    layout: TensorLayout,
) -> Vec<f32> {
    let value = |pixel: usize, channel: usize| match layout {
        TensorLayout::Nhwc => data[pixel * channels + channel],
        TensorLayout::Nchw => data[channel * plane + pixel],
    };

    (0..plane)
        .map(|pixel| {
            if channels == 1 {
                return sigmoid_clamped(value(pixel, 0), LOGIT_CLIP);
            }
            let max = (0..channels)
                .map(|c| value(pixel, c))
                .fold(f32::NEG_INFINITY, f32::max);
            let total: f32 = (0..channels).map(|c| (value(pixel, c) - max).exp()).sum();
            let background = (value(pixel, 0) - max).exp() / total;
            1.0 - background
        })
        .collect()
}

/// Sample the canvas probability map at every source pixel center.
fn resample(
    canvas: &[f32],
    (cw, ch): (usize, usize),
    padding: &LetterboxPadding,
    (width, height): (u32, u32),
) -> SegmentationMask {
    let at = |x: usize, y: usize| canvas[y * cw + x];
    let mut data = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        for x in 0..width {
            let source = Point::new(
                (x as f32 + 0.5) / width as f32,
                (y as f32 + 0.5) / height as f32,
            );
            let p = padding.forward_point(source);
            let cx = (p.x * cw as f32 - 0.5).clamp(0.0, (cw - 1) as f32);
            let cy = (p.y * ch as f32 - 0.5).clamp(0.0, (ch - 1) as f32);
            let (x0, y0) = (cx.floor() as usize, cy.floor() as usize);
            let (x1, y1) = ((x0 + 1).min(cw - 1), (y0 + 1).min(ch - 1));
            let (fx, fy) = (cx - x0 as f32, cy - y0 as f32);
            let top = at(x0, y0) + (at(x1, y0) - at(x0, y0)) * fx;
            let bottom = at(x0, y1) + (at(x1, y1) - at(x0, y1)) * fx;
            data.push(top + (bottom - top) * fy);
        }
    }
    SegmentationMask {
        width,
        height,
        data,
    }
}
