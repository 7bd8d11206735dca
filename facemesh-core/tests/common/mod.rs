//! Scripted inference models shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use facemesh_core::{
    AnchorConfig, DecodeConfig, DetectorOptions, FacePipeline, InferenceModel, InputRange,
    InputSize, InputSpec, OutputTensor, PipelineModels, PipelineOptions, TensorBuffer,
};
use facemesh_utils::{DetectionMode, TensorLayout};
use image::{Rgb, RgbImage, imageops::FilterType};

pub type DynModel = Box<dyn InferenceModel>;

pub const DETECTOR_INPUT: u32 = 16;
pub const MESH_INPUT: u32 = 32;
pub const IRIS_INPUT: u32 = 16;
const CHANNELS: usize = 16;

fn spec(edge: u32) -> InputSpec {
    InputSpec::new(
        InputSize::square(edge),
        TensorLayout::Nhwc,
        InputRange::SignedUnit,
    )
}

/// Detector over a 2x2 grid of stride-8 anchors. Anchor 0 is centered at (0.25, 0.25),
/// anchor 3 at (0.75, 0.75).
pub struct MockDetector {
    boxes: Vec<f32>,
    scores: Vec<f32>,
}

impl MockDetector {
    /// One upright face per `(anchor, logit)` pair.
    pub fn with_faces(faces: &[(usize, f32)]) -> Self {
        let mut boxes = vec![0.0f32; 4 * CHANNELS];
        let mut scores = vec![-10.0f32; 4];
        // Offsets in normalized units, scaled to raw input pixels.
        let face = [
            0.0, 0.0, 0.5, 0.5, // box
            -0.06, -0.05, // right eye
            0.06, -0.05, // left eye
            0.0, 0.0, // nose tip
            0.0, 0.08, // mouth
            -0.12, -0.02, // right ear
            0.12, -0.02, // left ear
        ];
        for &(anchor, logit) in faces {
            for (slot, value) in boxes[anchor * CHANNELS..(anchor + 1) * CHANNELS]
                .iter_mut()
                .zip(face)
            {
                *slot = value * DETECTOR_INPUT as f32;
            }
            scores[anchor] = logit;
        }
        Self { boxes, scores }
    }
}

impl InferenceModel for MockDetector {
    fn input_spec(&self) -> InputSpec {
        spec(DETECTOR_INPUT)
    }

    fn run(&mut self, _input: &TensorBuffer) -> anyhow::Result<Vec<OutputTensor>> {
        Ok(vec![
            OutputTensor::new(vec![1, 4, CHANNELS], self.boxes.clone()),
            OutputTensor::new(vec![1, 4, 1], self.scores.clone()),
        ])
    }
}

pub fn detector_options() -> DetectorOptions {
    DetectorOptions {
        anchors: AnchorConfig {
            num_layers: 1,
            strides: vec![8],
            input_width: DETECTOR_INPUT,
            input_height: DETECTOR_INPUT,
            anchor_offset_x: 0.5,
            anchor_offset_y: 0.5,
            interpolated_scale_aspect_ratio: 0.0,
        },
        decode: DecodeConfig {
            box_scale: DETECTOR_INPUT as f32,
            ..DecodeConfig::default()
        },
        mirror_output: false,
        filter: FilterType::Nearest,
    }
}

/// Mesh mock: every point at the crop center except four distinct eye corners.
/// Fails on bright crops when `fail_on_bright` is set.
pub struct MockMesh {
    pub calls: Arc<AtomicUsize>,
    pub fail_on_bright: bool,
    pub delay: Duration,
}

impl MockMesh {
    pub fn new(calls: Arc<AtomicUsize>) -> Self {
        Self {
            calls,
            fail_on_bright: false,
            delay: Duration::ZERO,
        }
    }
}

impl InferenceModel for MockMesh {
    fn input_spec(&self) -> InputSpec {
        spec(MESH_INPUT)
    }

    fn run(&mut self, input: &TensorBuffer) -> anyhow::Result<Vec<OutputTensor>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let values = input.as_slice();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        anyhow::ensure!(!(self.fail_on_bright && mean > 0.0), "mesh model rejected crop");

        let mut data = Vec::with_capacity(1404);
        for _ in 0..468 {
            data.extend_from_slice(&[16.0, 16.0, 0.0]);
        }
        for (index, x) in [(33, 8.0), (133, 14.0), (362, 18.0), (263, 24.0)] {
            data[index * 3] = x;
            data[index * 3 + 1] = 12.0;
        }
        Ok(vec![
            OutputTensor::new(vec![1, 1, 1, 1404], data),
            OutputTensor::new(vec![1, 1], vec![3.0]),
        ])
    }
}

/// Iris mock: eye mesh and iris at fixed crop positions.
pub struct MockIris {
    pub calls: Arc<AtomicUsize>,
}

impl InferenceModel for MockIris {
    fn input_spec(&self) -> InputSpec {
        spec(IRIS_INPUT)
    }

    fn run(&mut self, _input: &TensorBuffer) -> anyhow::Result<Vec<OutputTensor>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let eye: Vec<f32> = (0..71).flat_map(|i| [i as f32 % 16.0, 8.0, 0.0]).collect();
        let iris = vec![
            8.0, 8.0, 0.0, // center
            10.0, 8.0, 0.0, //
            8.0, 6.0, 0.0, //
            6.0, 8.0, 0.0, //
            8.0, 10.0, 0.0,
        ];
        Ok(vec![
            OutputTensor::new(vec![1, 213], eye),
            OutputTensor::new(vec![1, 15], iris),
        ])
    }
}

/// Forwards to `inner` and counts how many times it has been dropped.
pub struct DropTracked {
    pub inner: DynModel,
    pub drops: Arc<AtomicUsize>,
}

impl InferenceModel for DropTracked {
    fn input_spec(&self) -> InputSpec {
        self.inner.input_spec()
    }

    fn run(&mut self, input: &TensorBuffer) -> anyhow::Result<Vec<OutputTensor>> {
        self.inner.run(input)
    }
}

impl Drop for DropTracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockEmbedding;

impl InferenceModel for MockEmbedding {
    fn input_spec(&self) -> InputSpec {
        spec(112)
    }

    fn run(&mut self, _input: &TensorBuffer) -> anyhow::Result<Vec<OutputTensor>> {
        let data = (0..192).map(|i| (i % 7) as f32 - 3.0).collect();
        Ok(vec![OutputTensor::new(vec![1, 192], data)])
    }
}

pub struct MockSegmentation;

impl InferenceModel for MockSegmentation {
    fn input_spec(&self) -> InputSpec {
        spec(8)
    }

    fn run(&mut self, _input: &TensorBuffer) -> anyhow::Result<Vec<OutputTensor>> {
        Ok(vec![OutputTensor::new(vec![1, 8, 8, 1], vec![6.0; 64])])
    }
}

/// Counters observed by a test pipeline.
#[derive(Default, Clone)]
pub struct Calls {
    pub mesh: Arc<AtomicUsize>,
    pub iris: Arc<AtomicUsize>,
}

pub struct PipelineSpec {
    pub faces: Vec<(usize, f32)>,
    pub mesh_instances: usize,
    pub iris: bool,
    pub fail_bright_mesh: bool,
    pub mesh_delay: Duration,
    pub extras: bool,
    /// Counts drops of the detector model.
    pub detector_drops: Option<Arc<AtomicUsize>>,
}

impl Default for PipelineSpec {
    fn default() -> Self {
        Self {
            faces: vec![(0, 5.0), (3, 3.0)],
            mesh_instances: 2,
            iris: true,
            fail_bright_mesh: false,
            mesh_delay: Duration::ZERO,
            extras: false,
            detector_drops: None,
        }
    }
}

pub fn build_pipeline(setup: PipelineSpec) -> (FacePipeline<DynModel>, Calls) {
    let calls = Calls::default();
    (build_pipeline_with(setup, calls.clone()), calls)
}

/// Build a pipeline whose mocks report into `calls`.
pub fn build_pipeline_with(setup: PipelineSpec, calls: Calls) -> FacePipeline<DynModel> {
    let mesh = (0..setup.mesh_instances)
        .map(|_| {
            Box::new(MockMesh {
                calls: calls.mesh.clone(),
                fail_on_bright: setup.fail_bright_mesh,
                delay: setup.mesh_delay,
            }) as DynModel
        })
        .collect();
    let iris = setup.iris.then(|| {
        (
            Box::new(MockIris {
                calls: calls.iris.clone(),
            }) as DynModel,
            Box::new(MockIris {
                calls: calls.iris.clone(),
            }) as DynModel,
        )
    });
    let mut detector = Box::new(MockDetector::with_faces(&setup.faces)) as DynModel;
    if let Some(drops) = setup.detector_drops.clone() {
        detector = Box::new(DropTracked {
            inner: detector,
            drops,
        });
    }
    let models = PipelineModels {
        detector,
        mesh,
        iris,
        embedding: setup.extras.then(|| Box::new(MockEmbedding) as DynModel),
        segmentation: setup.extras.then(|| Box::new(MockSegmentation) as DynModel),
    };
    let options = PipelineOptions {
        detector: detector_options(),
        mode: DetectionMode::Full,
    };
    FacePipeline::new(models, options).expect("pipeline")
}

/// 64x64 image: bright top-left quadrant (face at anchor 0), dark elsewhere.
pub fn two_face_image() -> RgbImage {
    RgbImage::from_fn(64, 64, |x, y| {
        if x < 32 && y < 32 {
            Rgb([240, 240, 240])
        } else {
            Rgb([10, 10, 10])
        }
    })
}
