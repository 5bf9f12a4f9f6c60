//! Error taxonomy for training, persistence and scoring

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the pipeline library.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("{detector} is not trained: call fit() before score()")]
    NotTrained { detector: &'static str },

    #[error("Artifact shape mismatch: expected input dim {expected}, found {found}")]
    ArtifactShapeMismatch { expected: usize, found: usize },

    #[error("Missing artifact: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("Invalid parameter: {name} - {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Invalid feature {name}={value}: {reason}")]
    InvalidFeature {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    pub(crate) fn invalid_parameter(name: &str, reason: impl Into<String>) -> Self {
        PipelineError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_trained_display() {
        let error = PipelineError::NotTrained {
            detector: "isolation_forest",
        };
        assert_eq!(
            error.to_string(),
            "isolation_forest is not trained: call fit() before score()"
        );
    }

    #[test]
    fn test_shape_mismatch_display() {
        let error = PipelineError::ArtifactShapeMismatch {
            expected: 5,
            found: 7,
        };
        assert_eq!(
            error.to_string(),
            "Artifact shape mismatch: expected input dim 5, found 7"
        );
    }

    #[test]
    fn test_missing_artifact_display() {
        let error = PipelineError::MissingArtifact(PathBuf::from("artifacts/threshold.json"));
        assert_eq!(
            error.to_string(),
            "Missing artifact: artifacts/threshold.json"
        );
    }

    #[test]
    fn test_errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineError>();
    }
}
