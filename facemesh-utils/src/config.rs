//! Shared configuration types consumed across the facemesh workspace.
//!
//! [`PipelineSettings`] gathers model locations, detector thresholds, the requested
//! detection depth and worker/telemetry preferences. It round-trips through pretty
//! JSON so a deployment can pin its settings next to the model files.

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path, str::FromStr};

/// Which pre-trained face detector the anchors and input size are built for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectorVariant {
    /// 128x128 selfie model.
    FrontCamera,
    /// 256x256 model for rear-camera framing.
    BackCamera,
    /// 128x128 short-range model (same anchors as the front camera model).
    #[default]
    ShortRange,
    /// 192x192 full-range model with a single dense anchor layer.
    FullRange,
    /// Sparse variant of the full-range model; identical tensor contract.
    FullRangeSparse,
}

impl DetectorVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectorVariant::FrontCamera => "front_camera",
            DetectorVariant::BackCamera => "back_camera",
            DetectorVariant::ShortRange => "short_range",
            DetectorVariant::FullRange => "full_range",
            DetectorVariant::FullRangeSparse => "full_range_sparse",
        }
    }
}

impl fmt::Display for DetectorVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "front_camera" | "front" => Ok(DetectorVariant::FrontCamera),
            "back_camera" | "back" => Ok(DetectorVariant::BackCamera),
            "short_range" => Ok(DetectorVariant::ShortRange),
            "full_range" => Ok(DetectorVariant::FullRange),
            "full_range_sparse" => Ok(DetectorVariant::FullRangeSparse),
            other => Err(format!("unknown detector variant '{other}'")),
        }
    }
}

/// How far down the pipeline each detected face is processed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Bounding boxes and the six coarse keypoints only.
    Fast,
    /// Detection plus the 468-point mesh.
    Standard,
    /// Detection, mesh, and per-eye iris landmarks.
    #[default]
    Full,
}

impl DetectionMode {
    pub fn wants_mesh(self) -> bool {
        matches!(self, DetectionMode::Standard | DetectionMode::Full)
    }

    pub fn wants_iris(self) -> bool {
        matches!(self, DetectionMode::Full)
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectionMode::Fast => "fast",
            DetectionMode::Standard => "standard",
            DetectionMode::Full => "full",
        })
    }
}

impl FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(DetectionMode::Fast),
            "standard" => Ok(DetectionMode::Standard),
            "full" => Ok(DetectionMode::Full),
            other => Err(format!(
                "invalid detection mode '{other}'; expected 'fast', 'standard' or 'full'"
            )),
        }
    }
}

/// Resize filter preference for the letterbox step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResizeQuality {
    /// Preserve visual quality when resizing (Triangle filter).
    #[default]
    Quality,
    /// Prioritize throughput (Nearest filter).
    Speed,
}

impl fmt::Display for ResizeQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResizeQuality::Quality => "quality",
            ResizeQuality::Speed => "speed",
        })
    }
}

impl FromStr for ResizeQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quality" => Ok(ResizeQuality::Quality),
            "speed" => Ok(ResizeQuality::Speed),
            other => Err(format!(
                "invalid resize quality '{other}'; expected 'quality' or 'speed'"
            )),
        }
    }
}

/// Memory layout of the image tensors the models consume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// `[1, H, W, 3]`, the layout of converted TFLite graphs.
    #[default]
    Nhwc,
    /// `[1, 3, H, W]`.
    Nchw,
}

impl FromStr for TensorLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nhwc" => Ok(TensorLayout::Nhwc),
            "nchw" => Ok(TensorLayout::Nchw),
            other => Err(format!("invalid tensor layout '{other}'")),
        }
    }
}

/// Locations of the model files. Optional stages are skipped when their path is unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelPaths {
    pub detector: String,
    pub mesh: Option<String>,
    pub iris: Option<String>,
    pub embedding: Option<String>,
    pub segmentation: Option<String>,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            detector: "models/face_detection_short_range.onnx".into(),
            mesh: Some("models/face_landmark.onnx".into()),
            iris: Some("models/iris_landmark.onnx".into()),
            embedding: None,
            segmentation: None,
        }
    }
}

/// Detection decoding parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorSettings {
    pub variant: DetectorVariant,
    /// Anchors scoring below this are discarded before box decoding.
    pub min_score: f32,
    /// IoU at or above which candidates are merged by weighted NMS.
    pub nms_threshold: f32,
    /// Mirror every decoded detection horizontally (`x -> 1 - x`).
    pub mirror_output: bool,
    pub resize_quality: ResizeQuality,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            variant: DetectorVariant::default(),
            min_score: 0.5,
            nms_threshold: 0.3,
            mirror_output: false,
            resize_quality: ResizeQuality::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MeshSettings {
    /// Number of interchangeable mesh model instances in the pool.
    pub pool_size: usize,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self { pool_size: 2 }
    }
}

impl MeshSettings {
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerSettings {
    /// Deadline for spawning the worker and completing its handshake.
    pub init_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            init_timeout_ms: 30_000,
        }
    }
}

/// Settings controlling optional runtime telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    /// Logging level for telemetry output (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Resolve the configured level string into a `LevelFilter`.
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" | "warning" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Debug,
        }
    }

    /// Push these settings into the global telemetry switches.
    pub fn apply(&self) {
        crate::telemetry::configure(self);
    }
}

/// Everything needed to build a face pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PipelineSettings {
    pub models: ModelPaths,
    pub detector: DetectorSettings,
    pub mode: DetectionMode,
    pub tensor_layout: TensorLayout,
    pub mesh: MeshSettings,
    pub worker: WorkerSettings,
    pub telemetry: TelemetrySettings,
}

impl PipelineSettings {
    /// Load settings from a JSON file. Missing fields fall back to their defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let mut settings: PipelineSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;
        settings.sanitize();
        Ok(settings)
    }

    /// Serialize settings to disk in pretty-printed JSON, overwriting any existing file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }

    /// Clamp values to ranges the pipeline accepts.
    pub fn sanitize(&mut self) {
        self.detector.min_score = self.detector.min_score.clamp(0.0, 1.0);
        self.detector.nms_threshold = self.detector.nms_threshold.clamp(0.0, 1.0);
        self.mesh.pool_size = self.mesh.effective_pool_size();
    }
}
