use std::fmt;

use thiserror::Error;

/// Inference stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Detection,
    Mesh,
    Iris,
    Embedding,
    Segmentation,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Detection => "detection",
            Stage::Mesh => "mesh",
            Stage::Iris => "iris",
            Stage::Embedding => "embedding",
            Stage::Segmentation => "segmentation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the face pipeline.
///
/// Detection-stage errors abort a call. Alignment, mesh and iris errors are recorded
/// per face and never discard the other faces of the same image.
#[derive(Debug, Error)]
pub enum FaceMeshError {
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("degenerate alignment geometry: {0}")]
    Alignment(String),
    #[error("{stage} inference failed: {source:#}")]
    Inference {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
    #[error("{stage} model returned unexpected output: {detail}")]
    InvalidOutput { stage: Stage, detail: String },
    #[error("model pool is not initialized")]
    PoolNotInitialized,
    #[error("worker did not become ready within {0:?}")]
    WorkerTimeout(std::time::Duration),
    #[error("pipeline has been disposed")]
    Disposed,
    #[error("initialization failed: {0:#}")]
    Initialization(#[source] anyhow::Error),
}

impl FaceMeshError {
    pub(crate) fn inference(stage: Stage, source: anyhow::Error) -> Self {
        FaceMeshError::Inference { stage, source }
    }

    pub(crate) fn invalid_output(stage: Stage, detail: impl Into<String>) -> Self {
        FaceMeshError::InvalidOutput {
            stage,
            detail: detail.into(),
        }
    }

    /// Whether the error only affects one face rather than the whole call.
    pub fn is_per_face(&self) -> bool {
        match self {
            FaceMeshError::Alignment(_) => true,
            FaceMeshError::Inference { stage, .. } | FaceMeshError::InvalidOutput { stage, .. } => {
                matches!(stage, Stage::Mesh | Stage::Iris)
            }
            _ => false,
        }
    }
}
