//! Face embedding stage.
//!
//! The face is aligned with the same geometry as the mesh stage, sampled at the
//! model's input size (112x112 for the bundled recognizer) and mapped to an
//! L2-normalized vector.

use image::RgbImage;

use crate::alignment::face_roi;
use crate::crop::extract_aligned_crop;
use crate::error::{FaceMeshError, Stage};
use crate::model::{InferenceModel, TensorBuffer};
use crate::postprocess::Detection;

pub const DEFAULT_EMBEDDING_DIM: usize = 192;

/// Scale `values` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON && norm.is_finite() {
        values.iter_mut().for_each(|v| *v /= norm);
    }
}

/// Cosine similarity in `[-1, 1]`; `0.0` for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }
}

/// Euclidean distance between two embeddings; infinite for mismatched lengths.
pub fn embedding_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[derive(Debug)]
pub struct FaceEmbedder<M> {
    model: M,
    buffer: TensorBuffer,
    dimension: usize,
}

impl<M: InferenceModel> FaceEmbedder<M> {
    pub fn new(model: M) -> Result<Self, FaceMeshError> {
        Self::with_dimension(model, DEFAULT_EMBEDDING_DIM)
    }

    pub fn with_dimension(model: M, dimension: usize) -> Result<Self, FaceMeshError> {
        let spec = model.input_spec();
        if spec.size.width != spec.size.height || spec.size.width == 0 || dimension == 0 {
            return Err(FaceMeshError::Initialization(anyhow::anyhow!(
                "embedding model needs a square input and a non-zero dimension"
            )));
        }
        Ok(Self {
            model,
            buffer: TensorBuffer::new(spec),
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Unit-length embedding of the face described by `detection`.
    pub fn embed(
        &mut self,
        image: &RgbImage,
        detection: &Detection,
    ) -> Result<Vec<f32>, FaceMeshError> {
        let roi = face_roi(detection, image.width(), image.height())?;
        let crop = extract_aligned_crop(image, &roi, self.buffer.spec().size.width)?;
        self.buffer
            .fill(&crop.pixels)
            .map_err(|e| FaceMeshError::inference(Stage::Embedding, e))?;
        let outputs = self
            .model
            .run(&self.buffer)
            .map_err(|e| FaceMeshError::inference(Stage::Embedding, e))?;

        let mut embedding = outputs
            .into_iter()
            .find(|t| t.len() == self.dimension)
            .map(|t| t.data)
            .ok_or_else(|| {
                FaceMeshError::invalid_output(
                    Stage::Embedding,
                    format!("no output of {} values", self.dimension),
                )
            })?;
        l2_normalize(&mut embedding);
        Ok(embedding)
    }

    pub fn into_inner(self) -> M {
        self.model
    }
}
