//! Anomaly detectors, threshold calibration, artifacts and the scoring ensemble

pub mod artifacts;
pub mod autoencoder;
pub mod calibration;
pub mod inference;
pub mod isolation_forest;

pub use artifacts::{ArtifactBundle, ArtifactStore, Thresholds};
pub use autoencoder::{Autoencoder, AutoencoderParams, ComputeDevice};
pub use calibration::{Calibration, ThresholdCalibrator};
pub use inference::ScoringEnsemble;
pub use isolation_forest::IsolationForest;

use crate::error::Result;
use crate::types::score::DetectorKind;
use ndarray::{ArrayView1, ArrayView2, Axis};

/// A trained detector scoring standardized rows.
///
/// Scores are oriented so that larger means more anomalous. Implementations
/// are immutable once trained, so a shared reference can score concurrently.
pub trait AnomalyDetector: Send + Sync {
    /// Which ensemble member this is
    fn kind(&self) -> DetectorKind;

    /// Check if the detector has been fit or restored
    fn is_trained(&self) -> bool;

    /// Score one standardized row
    fn score(&self, row: ArrayView1<'_, f64>) -> Result<f64>;

    /// Score every row of a standardized matrix
    fn score_batch(&self, rows: ArrayView2<'_, f64>) -> Result<Vec<f64>> {
        rows.axis_iter(Axis(0)).map(|row| self.score(row)).collect()
    }
}
