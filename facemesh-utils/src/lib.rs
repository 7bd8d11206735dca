//! Common helpers shared across the facemesh crates.

/// Pipeline settings and their JSON persistence.
pub mod config;
/// Image loading, decoding, and tensor filling.
pub mod image_utils;
/// 2D/3D point arithmetic used by the alignment geometry.
pub mod point;
/// Structured JSON records for per-stage timings and call statistics.
pub mod telemetry;

use std::path::Path;

use anyhow::Result;
use log::LevelFilter;

pub use config::{
    DetectionMode, DetectorSettings, DetectorVariant, MeshSettings, ModelPaths, PipelineSettings,
    ResizeQuality, TelemetrySettings, TensorLayout, WorkerSettings,
};
pub use image_utils::{decode_image, fill_tensor, resize_image};
pub use point::{Point, Point3};
pub use telemetry::{StageSpan, record_event, stage_span, telemetry_enabled, telemetry_level};

/// Initialize logging once.
///
/// This function respects the `RUST_LOG` environment variable if it is set.
/// Otherwise, it falls back to the provided default filter level.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module(telemetry::TELEMETRY_TARGET, LevelFilter::Trace);

    if builder.try_init().is_err() {
        // Logger already initialized; nothing to do.
    }
    Ok(())
}

/// Validate that a path exists and resolve it to an absolute path.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<std::path::PathBuf> {
    let path = path.as_ref();
    anyhow::ensure!(path.exists(), "path does not exist: {}", path.display());
    Ok(path.canonicalize()?)
}
