use std::{fmt::Write, path::Path};

use anyhow::{Context, Result};
use facemesh_utils::{config::TensorLayout, fill_tensor, normalize_path};
use image::RgbImage;
use log::{debug, warn};
use tract_onnx::prelude::{
    DatumExt, Framework, Graph, InferenceModelExt, IntoTensor, SimplePlan, Tensor, TypedFact,
    TypedOp, tvec,
};

use crate::preprocess::InputSize;

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Value range a model expects its `0..=255` pixels mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputRange {
    /// `[-1, 1]`, used by the detector, mesh and iris graphs.
    #[default]
    SignedUnit,
    /// `[0, 1]`.
    Unit,
}

impl InputRange {
    pub fn bounds(self) -> (f32, f32) {
        match self {
            InputRange::SignedUnit => (-1.0, 1.0),
            InputRange::Unit => (0.0, 1.0),
        }
    }
}

/// Fixed input contract of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub size: InputSize,
    pub layout: TensorLayout,
    pub range: InputRange,
}

impl InputSpec {
    pub const fn new(size: InputSize, layout: TensorLayout, range: InputRange) -> Self {
        Self {
            size,
            layout,
            range,
        }
    }

    /// Tensor shape including the batch dimension.
    pub fn shape(&self) -> [usize; 4] {
        let (w, h) = (self.size.width as usize, self.size.height as usize);
        match self.layout {
            TensorLayout::Nhwc => [1, h, w, 3],
            TensorLayout::Nchw => [1, 3, h, w],
        }
    }
}

/// Flat input tensor allocated once per model instance and refilled for every call.
#[derive(Debug, Clone)]
pub struct TensorBuffer {
    spec: InputSpec,
    data: Vec<f32>,
}

impl TensorBuffer {
    pub fn new(spec: InputSpec) -> Self {
        Self {
            spec,
            data: vec![0.0; spec.size.tensor_len()],
        }
    }

    pub fn spec(&self) -> InputSpec {
        self.spec
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Overwrite the buffer with `image`, which must already have the input size.
    pub fn fill(&mut self, image: &RgbImage) -> Result<()> {
        let expected = self.spec.size;
        anyhow::ensure!(
            image.dimensions() == (expected.width, expected.height),
            "image is {}x{}, model expects {}x{}",
            image.width(),
            image.height(),
            expected.width,
            expected.height
        );
        fill_tensor(image, self.spec.layout, self.spec.range.bounds(), &mut self.data)
    }
}

/// One model output, flattened.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl OutputTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An opaque tensor-in/tensor-out inference function.
///
/// `run` takes `&mut self` so implementations may keep per-instance scratch state; the
/// pool guarantees no two calls overlap on one instance.
pub trait InferenceModel: Send {
    fn input_spec(&self) -> InputSpec;

    fn run(&mut self, input: &TensorBuffer) -> Result<Vec<OutputTensor>>;
}

impl<M: InferenceModel + ?Sized> InferenceModel for Box<M> {
    fn input_spec(&self) -> InputSpec {
        (**self).input_spec()
    }

    fn run(&mut self, input: &TensorBuffer) -> Result<Vec<OutputTensor>> {
        (**self).run(input)
    }
}

/// Model backed by an ONNX graph executed with `tract-onnx`.
#[derive(Debug)]
pub struct OnnxModel {
    runnable: RunnableModel,
    spec: InputSpec,
    name: String,
}

impl OnnxModel {
    /// Load and optimize an ONNX graph with its input pinned to `spec`.
    pub fn load<P: AsRef<Path>>(model_path: P, spec: InputSpec) -> Result<Self> {
        let path = normalize_path(model_path).context("failed to locate model file")?;
        let path = path.as_path();
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());

        let runnable = match load_runnable_model(path, spec, true) {
            Ok(model) => {
                debug!(
                    "model {} optimized successfully ({}x{})",
                    path.display(),
                    spec.size.width,
                    spec.size.height
                );
                model
            }
            Err(opt_err) => {
                let optimize_msg = format!("{opt_err}");
                let mut chain_msg = String::new();
                for cause in opt_err.chain() {
                    let _ = writeln!(&mut chain_msg, "  - {cause}");
                }
                warn!(
                    "model {} failed optimized load ({}); falling back to decluttered graph.\nError chain:\n{}",
                    path.display(),
                    optimize_msg,
                    chain_msg.trim_end()
                );
                load_runnable_model(path, spec, false).with_context(|| {
                    format!("fallback to decluttered graph failed after optimize error: {optimize_msg}")
                })?
            }
        };

        Ok(Self {
            runnable,
            spec,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl InferenceModel for OnnxModel {
    fn input_spec(&self) -> InputSpec {
        self.spec
    }

    fn run(&mut self, input: &TensorBuffer) -> Result<Vec<OutputTensor>> {
        let tensor = Tensor::from_shape(&input.spec().shape(), input.as_slice())
            .map_err(|e| anyhow::anyhow!("failed to build input tensor for {}: {e}", self.name))?;
        let outputs = self
            .runnable
            .run(tvec![tensor.into()])
            .map_err(|e| anyhow::anyhow!("{} execution failed: {e}", self.name))?;

        outputs
            .into_iter()
            .map(|value| {
                let tensor = value.into_tensor();
                let shape = tensor.shape().to_vec();
                let floats = tensor
                    .cast_to::<f32>()
                    .map_err(|e| anyhow::anyhow!("{} output is not numeric: {e}", self.name))?;
                let data = floats
                    .as_slice::<f32>()
                    .map_err(|e| anyhow::anyhow!("{} output is not f32: {e}", self.name))?
                    .to_vec();
                Ok(OutputTensor { shape, data })
            })
            .collect()
    }
}

fn load_runnable_model(path: &Path, spec: InputSpec, optimized: bool) -> Result<RunnableModel> {
    let model = tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to parse ONNX graph from {}", path.display()))?
        .with_input_fact(0, f32::fact(spec.shape()).into())
        .map_err(|e| anyhow::anyhow!("unable to pin input shape {:?}: {e}", spec.shape()))?;

    if optimized {
        model
            .into_optimized()
            .map_err(|e| anyhow::anyhow!("unable to optimize graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("unable to make graph runnable: {e}"))
    } else {
        model
            .into_typed()
            .map_err(|e| anyhow::anyhow!("unable to type-check graph: {e}"))?
            .into_decluttered()
            .map_err(|e| anyhow::anyhow!("unable to declutter graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("unable to make graph runnable: {e}"))
    }
}
