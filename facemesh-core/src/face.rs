//! Per-face results and the batch statistics derived from them.

use serde::Serialize;

use crate::error::FaceMeshError;
use crate::landmarks::{EyeLandmarks, Mesh};
use crate::postprocess::Detection;

/// Iris landmarks for both eyes, named from the subject's point of view.
#[derive(Debug, Clone, PartialEq)]
pub struct EyePair {
    pub right: EyeLandmarks,
    pub left: EyeLandmarks,
}

/// Outcome of every stage for one detected face.
///
/// `None` means the stage was not requested or could not be reached; `Some(Err(_))`
/// records a failure confined to this face.
#[derive(Debug)]
pub struct FaceResult {
    pub detection: Detection,
    pub mesh: Option<Result<Mesh, FaceMeshError>>,
    pub eyes: Option<Result<EyePair, FaceMeshError>>,
}

impl FaceResult {
    pub fn detection_only(detection: Detection) -> Self {
        Self {
            detection,
            mesh: None,
            eyes: None,
        }
    }

    pub fn mesh(&self) -> Option<&Mesh> {
        self.mesh.as_ref().and_then(|r| r.as_ref().ok())
    }
}

/// A detected face with whichever features were produced for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    pub detection: Detection,
    pub mesh: Option<Mesh>,
    pub eyes: Option<EyePair>,
}

impl From<FaceResult> for Face {
    fn from(result: FaceResult) -> Self {
        Face {
            detection: result.detection,
            mesh: result.mesh.and_then(Result::ok),
            eyes: result.eyes.and_then(Result::ok),
        }
    }
}

/// Success and failure counts over one image's faces.
///
/// Degenerate crop geometry is counted under `alignment_failed` whichever stage hit
/// it; `mesh_failed` and `iris_failed` only count model failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub faces: usize,
    pub mesh_ok: usize,
    pub mesh_failed: usize,
    pub iris_ok: usize,
    pub iris_failed: usize,
    pub alignment_failed: usize,
}

impl BatchStats {
    pub fn from_results(results: &[FaceResult]) -> Self {
        results.iter().fold(
            BatchStats {
                faces: results.len(),
                ..BatchStats::default()
            },
            |mut stats, result| {
                match &result.mesh {
                    Some(Ok(_)) => stats.mesh_ok += 1,
                    Some(Err(FaceMeshError::Alignment(_))) => stats.alignment_failed += 1,
                    Some(Err(_)) => stats.mesh_failed += 1,
                    None => {}
                }
                match &result.eyes {
                    Some(Ok(_)) => stats.iris_ok += 1,
                    Some(Err(FaceMeshError::Alignment(_))) => stats.alignment_failed += 1,
                    Some(Err(_)) => stats.iris_failed += 1,
                    None => {}
                }
                stats
            },
        )
    }
}

/// Result of one pipeline call.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionReport {
    pub faces: Vec<Face>,
    pub stats: BatchStats,
    /// Source image `(width, height)` the normalized detections refer to.
    pub image_size: (u32, u32),
}

impl DetectionReport {
    pub fn from_results(results: Vec<FaceResult>, image_size: (u32, u32)) -> Self {
        let stats = BatchStats::from_results(&results);
        Self {
            faces: results.into_iter().map(Face::from).collect(),
            stats,
            image_size,
        }
    }
}
