//! Core face pipeline primitives.
//!
//! This crate decodes anchor-relative detector output, aligns faces and eyes into
//! rotation-corrected crops, and drives mesh/iris inference through a pool of
//! interchangeable model instances. Models are opaque [`InferenceModel`]s; the
//! bundled [`OnnxModel`] runs them with `tract-onnx`.

/// Face and eye region-of-interest geometry.
pub mod alignment;
/// SSD anchor grid generation.
pub mod anchors;
/// Rotated crop extraction with bilinear sampling.
pub mod crop;
/// Face detector stage: letterbox, inference, decode, NMS.
pub mod detector;
/// Face embedding stage.
pub mod embedding;
/// Error taxonomy shared by every stage.
pub mod error;
/// Per-face results and batch statistics.
pub mod face;
/// Raw pixel buffer ingestion.
pub mod input;
/// Mesh and iris landmark stages.
pub mod landmarks;
/// Inference model abstraction and the ONNX backend.
pub mod model;
/// Multi-stage orchestrator.
pub mod pipeline;
/// Round-robin pool of serialized model handles.
pub mod pool;
/// Detection decoding and weighted non-max suppression.
pub mod postprocess;
/// Letterbox transform and its inverse.
pub mod preprocess;
/// Person segmentation stage.
pub mod segmentation;
/// Background worker running a pipeline behind message passing.
pub mod worker;

pub use alignment::{AlignedRoi, eye_rois, face_roi};
pub use anchors::{Anchor, AnchorConfig, AnchorGrid, generate_anchors};
pub use crop::{AlignedCrop, extract_aligned_crop};
pub use detector::{DetectorOptions, FaceDetector};
pub use embedding::{FaceEmbedder, cosine_similarity, embedding_distance, l2_normalize};
pub use error::{FaceMeshError, Stage};
pub use face::{BatchStats, DetectionReport, EyePair, Face, FaceResult};
pub use input::{PixelBuffer, PixelFormat};
pub use landmarks::{EyeLandmarks, IrisModel, Mesh, MeshModel};
pub use model::{InferenceModel, InputRange, InputSpec, OnnxModel, OutputTensor, TensorBuffer};
pub use pipeline::{FacePipeline, PipelineModels, PipelineOptions};
pub use pool::ModelPool;
pub use postprocess::{
    DecodeConfig, Detection, FaceKeypoint, NormalizedRect, decode_detections, iou,
    sigmoid_clamped, weighted_non_max_suppression,
};
pub use preprocess::{InputSize, LetterboxPadding, Letterboxed, letterbox_image};
pub use segmentation::{SegmentationMask, Segmenter};
pub use worker::{
    PipelineWorker, WorkerOperation, WorkerOptions, WorkerPayload, WorkerRequest, WorkerResponse,
};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
