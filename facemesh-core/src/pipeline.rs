//! Multi-stage face pipeline.
//!
//! One call letterboxes and detects once, then fans out per face: face alignment and
//! mesh inference through the mesh pool, and after every mesh has landed, eye
//! alignment with the right and left iris models running side by side. Failures past
//! detection stay confined to the face they happened on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use facemesh_utils::{
    DetectionMode, PipelineSettings, record_event, stage_span, telemetry_enabled,
    telemetry_level,
};
use image::{DynamicImage, RgbImage};
use log::{Level, debug, info, warn};
use rayon::prelude::*;

use crate::alignment::{eye_rois, face_roi};
use crate::crop::extract_aligned_crop;
use crate::detector::{DetectorOptions, FaceDetector};
use crate::embedding::FaceEmbedder;
use crate::error::{FaceMeshError, Stage};
use crate::face::{DetectionReport, EyePair, Face, FaceResult};
use crate::input::{PixelBuffer, decode_rgb};
use crate::landmarks::{IrisModel, Mesh, MeshModel};
use crate::model::{InferenceModel, InputRange, InputSpec, OnnxModel};
use crate::pool::ModelPool;
use crate::postprocess::Detection;
use crate::preprocess::InputSize;
use crate::segmentation::{SegmentationMask, Segmenter};

const MESH_INPUT: u32 = 192;
const IRIS_INPUT: u32 = 64;
const EMBEDDING_INPUT: u32 = 112;
const SEGMENTATION_INPUT: u32 = 256;

/// Model instances a pipeline is assembled from.
pub struct PipelineModels<M> {
    pub detector: M,
    /// Interchangeable mesh instances; one pool handle each.
    pub mesh: Vec<M>,
    /// Iris instances for the subject's `(right, left)` eye.
    pub iris: Option<(M, M)>,
    pub embedding: Option<M>,
    pub segmentation: Option<M>,
}

impl<M> PipelineModels<M> {
    pub fn detector_only(detector: M) -> Self {
        Self {
            detector,
            mesh: Vec::new(),
            iris: None,
            embedding: None,
            segmentation: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub detector: DetectorOptions,
    pub mode: DetectionMode,
}

impl PipelineOptions {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            detector: DetectorOptions::from_settings(&settings.detector),
            mode: settings.mode,
        }
    }
}

struct MeshStage<M> {
    pool: ModelPool<MeshModel<M>>,
    input: u32,
}

struct IrisStage<M> {
    right: ModelPool<IrisModel<M>>,
    left: ModelPool<IrisModel<M>>,
    input: u32,
}

/// Face pipeline over a set of models of type `M`.
pub struct FacePipeline<M> {
    detector: ModelPool<FaceDetector<M>>,
    mesh: Option<MeshStage<M>>,
    iris: Option<IrisStage<M>>,
    embedder: Option<ModelPool<FaceEmbedder<M>>>,
    segmenter: Option<ModelPool<Segmenter<M>>>,
    mode: DetectionMode,
    disposed: AtomicBool,
}

impl FacePipeline<OnnxModel> {
    /// Load every configured model from disk.
    ///
    /// The mesh pool gets `settings.mesh.pool_size` instances; iris gets one instance
    /// per eye. Unset optional paths leave their stage unavailable.
    pub fn from_settings(settings: &PipelineSettings) -> Result<Self, FaceMeshError> {
        settings.telemetry.apply();
        debug!(
            "facemesh-core {} loading models (telemetry {}, level {})",
            crate::version(),
            if telemetry_enabled() { "on" } else { "off" },
            telemetry_level()
        );
        let layout = settings.tensor_layout;
        let spec = |edge: u32, range: InputRange| {
            InputSpec::new(InputSize::square(edge), layout, range)
        };
        let load = |path: &str, spec: InputSpec| {
            OnnxModel::load(path, spec).map_err(FaceMeshError::Initialization)
        };

        let options = PipelineOptions::from_settings(settings);
        let detector_spec = InputSpec::new(
            InputSize::new(
                options.detector.anchors.input_width,
                options.detector.anchors.input_height,
            ),
            layout,
            InputRange::SignedUnit,
        );
        let paths = &settings.models;
        let models = PipelineModels {
            detector: load(&paths.detector, detector_spec)?,
            mesh: match &paths.mesh {
                Some(path) => (0..settings.mesh.effective_pool_size())
                    .map(|_| load(path, spec(MESH_INPUT, InputRange::SignedUnit)))
                    .collect::<Result<_, _>>()?,
                None => Vec::new(),
            },
            iris: match &paths.iris {
                Some(path) => Some((
                    load(path, spec(IRIS_INPUT, InputRange::SignedUnit))?,
                    load(path, spec(IRIS_INPUT, InputRange::SignedUnit))?,
                )),
                None => None,
            },
            embedding: paths
                .embedding
                .as_deref()
                .map(|path| load(path, spec(EMBEDDING_INPUT, InputRange::SignedUnit)))
                .transpose()?,
            segmentation: paths
                .segmentation
                .as_deref()
                .map(|path| load(path, spec(SEGMENTATION_INPUT, InputRange::Unit)))
                .transpose()?,
        };
        info!(
            "loaded face pipeline ({} detector, {} mesh instance(s), iris {})",
            settings.detector.variant,
            models.mesh.len(),
            if models.iris.is_some() { "on" } else { "off" }
        );
        FacePipeline::new(models, options)
    }
}

impl<M: InferenceModel> FacePipeline<M> {
    pub fn new(
        models: PipelineModels<M>,
        options: PipelineOptions,
    ) -> Result<Self, FaceMeshError> {
        let detector = FaceDetector::new(models.detector, options.detector)?;

        let mesh = if models.mesh.is_empty() {
            None
        } else {
            let instances = models
                .mesh
                .into_iter()
                .map(MeshModel::new)
                .collect::<Result<Vec<_>, _>>()?;
            let input = instances[0].input_size();
            if instances.iter().any(|m| m.input_size() != input) {
                return Err(FaceMeshError::Initialization(anyhow::anyhow!(
                    "mesh instances disagree on input size"
                )));
            }
            Some(MeshStage {
                pool: ModelPool::new(instances)?,
                input,
            })
        };

        let iris = match models.iris {
            Some((right, left)) => {
                let (right, left) = (IrisModel::new(right)?, IrisModel::new(left)?);
                let input = right.input_size();
                if left.input_size() != input {
                    return Err(FaceMeshError::Initialization(anyhow::anyhow!(
                        "iris instances disagree on input size"
                    )));
                }
                Some(IrisStage {
                    right: ModelPool::single(right),
                    left: ModelPool::single(left),
                    input,
                })
            }
            None => None,
        };

        Ok(Self {
            detector: ModelPool::single(detector),
            mesh,
            iris,
            embedder: models
                .embedding
                .map(|m| FaceEmbedder::new(m).map(ModelPool::single))
                .transpose()?,
            segmenter: models
                .segmentation
                .map(|m| Segmenter::new(m).map(ModelPool::single))
                .transpose()?,
            mode: options.mode,
            disposed: AtomicBool::new(false),
        })
    }

    /// Mode used by callers that do not pick one.
    pub fn default_mode(&self) -> DetectionMode {
        self.mode
    }

    pub fn mesh_pool_size(&self) -> usize {
        self.mesh.as_ref().map_or(0, |stage| stage.pool.capacity())
    }

    pub fn supports(&self, mode: DetectionMode) -> bool {
        (!mode.wants_mesh() || self.mesh.is_some()) && (!mode.wants_iris() || self.iris.is_some())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<(), FaceMeshError> {
        if self.is_disposed() {
            Err(FaceMeshError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Detect faces and run the stages `mode` asks for.
    pub fn detect(
        &self,
        image: &RgbImage,
        mode: DetectionMode,
    ) -> Result<DetectionReport, FaceMeshError> {
        self.ensure_live()?;
        if !self.supports(mode) {
            return Err(FaceMeshError::PoolNotInitialized);
        }
        let started = Instant::now();

        let detections = self.detector.run(|detector| detector.detect(image))?;
        let mut results: Vec<FaceResult> = match &self.mesh {
            Some(stage) if mode.wants_mesh() => self.mesh_stage(stage, image, detections),
            _ => detections.into_iter().map(FaceResult::detection_only).collect(),
        };
        if let Some(stage) = &self.iris
            && mode.wants_iris()
        {
            self.iris_stage(stage, image, &mut results);
        }

        let report = DetectionReport::from_results(results, image.dimensions());
        debug!(
            "detected {} face(s) in {}x{} image ({mode})",
            report.stats.faces,
            image.width(),
            image.height()
        );
        record_event(Level::Info, "detect", || {
            serde_json::json!({
                "mode": mode.to_string(),
                "image": [image.width(), image.height()],
                "stats": report.stats,
                "elapsed_ms": started.elapsed().as_secs_f64() * 1_000.0,
            })
        });
        Ok(report)
    }

    fn mesh_stage(
        &self,
        stage: &MeshStage<M>,
        image: &RgbImage,
        detections: Vec<Detection>,
    ) -> Vec<FaceResult> {
        let _guard = stage_span(Stage::Mesh.as_str(), "total", Level::Debug);
        detections
            .into_par_iter()
            .enumerate()
            .map(|(index, detection)| {
                let mesh = mesh_for(stage, image, &detection);
                if let Err(err) = &mesh {
                    warn!("face {index}: {} stage failed: {err}", Stage::Mesh);
                }
                FaceResult {
                    detection,
                    mesh: Some(mesh),
                    eyes: None,
                }
            })
            .collect()
    }

    fn iris_stage(&self, stage: &IrisStage<M>, image: &RgbImage, results: &mut [FaceResult]) {
        let _guard = stage_span(Stage::Iris.as_str(), "total", Level::Debug);
        results
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, result)| {
                let Some(mesh) = result.mesh() else {
                    return;
                };
                let eyes = eyes_for(stage, image, mesh);
                if let Err(err) = &eyes {
                    warn!("face {index}: {} stage failed: {err}", Stage::Iris);
                }
                result.eyes = Some(eyes);
            });
    }

    /// [`detect`](Self::detect) for any image type.
    pub fn detect_dynamic(
        &self,
        image: &DynamicImage,
        mode: DetectionMode,
    ) -> Result<DetectionReport, FaceMeshError> {
        match image {
            DynamicImage::ImageRgb8(rgb) => self.detect(rgb, mode),
            other => self.detect(&other.to_rgb8(), mode),
        }
    }

    /// Decode PNG/JPEG bytes and detect.
    pub fn detect_encoded(
        &self,
        bytes: &[u8],
        mode: DetectionMode,
    ) -> Result<DetectionReport, FaceMeshError> {
        self.ensure_live()?;
        self.detect(&decode_rgb(bytes)?, mode)
    }

    /// Detect on a raw pixel buffer, taking ownership of its bytes.
    pub fn detect_pixels(
        &self,
        pixels: PixelBuffer,
        mode: DetectionMode,
    ) -> Result<DetectionReport, FaceMeshError> {
        self.ensure_live()?;
        self.detect(&pixels.into_rgb()?, mode)
    }

    /// L2-normalized embedding of a face previously detected in `image`.
    pub fn embed(&self, image: &RgbImage, face: &Face) -> Result<Vec<f32>, FaceMeshError> {
        self.ensure_live()?;
        let pool = self
            .embedder
            .as_ref()
            .ok_or(FaceMeshError::PoolNotInitialized)?;
        pool.run(|embedder| embedder.embed(image, &face.detection))
    }

    /// Person probability mask at the resolution of `image`.
    pub fn segment(&self, image: &RgbImage) -> Result<SegmentationMask, FaceMeshError> {
        self.ensure_live()?;
        let pool = self
            .segmenter
            .as_ref()
            .ok_or(FaceMeshError::PoolNotInitialized)?;
        pool.run(|segmenter| segmenter.segment(image))
    }

    /// Release every model handle. Returns how many were released; later calls
    /// release nothing and every operation fails with `Disposed`.
    pub fn dispose(&self) -> usize {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let mut released = self.detector.dispose();
        if let Some(stage) = &self.mesh {
            released += stage.pool.dispose();
        }
        if let Some(stage) = &self.iris {
            released += stage.right.dispose() + stage.left.dispose();
        }
        if let Some(pool) = &self.embedder {
            released += pool.dispose();
        }
        if let Some(pool) = &self.segmenter {
            released += pool.dispose();
        }
        debug!("face pipeline disposed ({released} model handle(s) released)");
        released
    }
}

fn mesh_for<M: InferenceModel>(
    stage: &MeshStage<M>,
    image: &RgbImage,
    detection: &Detection,
) -> Result<Mesh, FaceMeshError> {
    let roi = face_roi(detection, image.width(), image.height())?;
    let crop = extract_aligned_crop(image, &roi, stage.input)?;
    stage.pool.run(|model| model.infer(&crop))
}

/// The subject's right eye is mirrored so both eyes are seen as a left eye by the model.
fn eyes_for<M: InferenceModel>(
    stage: &IrisStage<M>,
    image: &RgbImage,
    mesh: &Mesh,
) -> Result<EyePair, FaceMeshError> {
    let (right_roi, left_roi) = eye_rois(mesh)?;
    let right_crop = extract_aligned_crop(image, &right_roi, stage.input)?.mirrored();
    let left_crop = extract_aligned_crop(image, &left_roi, stage.input)?;

    let (right, left) = rayon::join(
        || stage.right.run(|model| model.infer(&right_crop)),
        || stage.left.run(|model| model.infer(&left_crop)),
    );
    Ok(EyePair {
        right: right?,
        left: left?,
    })
}

impl<M> std::fmt::Debug for FacePipeline<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacePipeline")
            .field("mode", &self.mode)
            .field("mesh", &self.mesh.as_ref().map(|s| s.pool.capacity()))
            .field("iris", &self.iris.is_some())
            .field("embedding", &self.embedder.is_some())
            .field("segmentation", &self.segmenter.is_some())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}
