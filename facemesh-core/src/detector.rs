use facemesh_utils::{config::DetectorSettings, stage_span};
use image::{RgbImage, imageops::FilterType};
use log::{Level, debug};

use crate::anchors::{AnchorConfig, AnchorGrid, generate_anchors};
use crate::error::{FaceMeshError, Stage};
use crate::model::{InferenceModel, OutputTensor, TensorBuffer};
use crate::postprocess::{DecodeConfig, Detection, decode_detections, weighted_non_max_suppression};
use crate::preprocess::{letterbox_image, resize_filter, unletterbox_detection};

/// Detector configuration: the anchor layout the model was trained with plus thresholds.
#[derive(Debug, Clone)]
pub struct DetectorOptions {
    pub anchors: AnchorConfig,
    pub decode: DecodeConfig,
    /// Mirror every decoded detection (`x -> 1 - x`) after unletterboxing.
    pub mirror_output: bool,
    pub filter: FilterType,
}

impl DetectorOptions {
    pub fn from_settings(settings: &DetectorSettings) -> Self {
        let anchors = AnchorConfig::for_variant(settings.variant);
        Self {
            decode: DecodeConfig::from_settings(settings, &anchors),
            anchors,
            mirror_output: settings.mirror_output,
            filter: resize_filter(settings.resize_quality),
        }
    }
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self::from_settings(&DetectorSettings::default())
    }
}

/// Couples a detector model with its anchors, input buffer and decode settings.
///
/// This is the entry point of the pipeline: letterbox, inference, decode, weighted NMS,
/// then mapping back to source-image coordinates.
#[derive(Debug)]
pub struct FaceDetector<M> {
    model: M,
    buffer: TensorBuffer,
    anchors: AnchorGrid,
    options: DetectorOptions,
}

impl<M: InferenceModel> FaceDetector<M> {
    pub fn new(model: M, options: DetectorOptions) -> Result<Self, FaceMeshError> {
        options.anchors.validate()?;
        let spec = model.input_spec();
        if (spec.size.width, spec.size.height)
            != (options.anchors.input_width, options.anchors.input_height)
        {
            return Err(FaceMeshError::Initialization(anyhow::anyhow!(
                "detector input {}x{} does not match anchor layout {}x{}",
                spec.size.width,
                spec.size.height,
                options.anchors.input_width,
                options.anchors.input_height
            )));
        }

        let anchors = generate_anchors(&options.anchors);
        debug!(
            "face detector ready: {} anchors, input {}x{}",
            anchors.len(),
            spec.size.width,
            spec.size.height
        );
        Ok(Self {
            model,
            buffer: TensorBuffer::new(spec),
            anchors,
            options,
        })
    }

    pub fn anchors(&self) -> &AnchorGrid {
        &self.anchors
    }

    pub fn options(&self) -> &DetectorOptions {
        &self.options
    }

    /// Detect faces in `image`, returning detections normalized to the image.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, FaceMeshError> {
        let _guard = stage_span(Stage::Detection.as_str(), "total", Level::Debug);

        let letterboxed = {
            let _guard = stage_span(Stage::Detection.as_str(), "letterbox", Level::Trace);
            letterbox_image(image, self.buffer.spec().size, self.options.filter)?
        };
        self.buffer
            .fill(&letterboxed.canvas)
            .map_err(|e| FaceMeshError::inference(Stage::Detection, e))?;

        let outputs = {
            let _guard = stage_span(Stage::Detection.as_str(), "inference", Level::Debug);
            self.model
                .run(&self.buffer)
                .map_err(|e| FaceMeshError::inference(Stage::Detection, e))?
        };

        let _guard = stage_span(Stage::Detection.as_str(), "decode", Level::Debug);
        let (boxes, scores) = self.split_outputs(&outputs)?;
        let candidates = decode_detections(boxes, scores, &self.anchors, &self.options.decode)?;
        let candidate_count = candidates.len();
        let kept = weighted_non_max_suppression(candidates, self.options.decode.nms_threshold);
        debug!("detector kept {} of {} candidates", kept.len(), candidate_count);

        Ok(kept
            .iter()
            .map(|d| {
                let restored = unletterbox_detection(d, &letterboxed.padding);
                if self.options.mirror_output {
                    restored.mirrored()
                } else {
                    restored
                }
            })
            .collect())
    }

    /// Find the box and score tensors by element count, independent of output order.
    fn split_outputs<'a>(
        &self,
        outputs: &'a [OutputTensor],
    ) -> Result<(&'a [f32], &'a [f32]), FaceMeshError> {
        let anchors = self.anchors.len();
        let box_len = anchors * self.options.decode.channels();
        let find = |len: usize| outputs.iter().find(|t| t.len() == len);
        match (find(box_len), find(anchors)) {
            (Some(boxes), Some(scores)) => Ok((&boxes.data, &scores.data)),
            _ => Err(FaceMeshError::invalid_output(
                Stage::Detection,
                format!(
                    "expected box tensor of {box_len} and score tensor of {anchors} values, got lengths {:?}",
                    outputs.iter().map(OutputTensor::len).collect::<Vec<_>>()
                ),
            )),
        }
    }

    pub fn into_inner(self) -> M {
        self.model
    }
}
