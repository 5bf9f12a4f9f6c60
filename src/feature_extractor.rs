//! Feature contract shared by training and serving.
//!
//! The order of [`FEATURES`] is the detectors' input contract; changing it
//! invalidates every persisted artifact.

use crate::types::transaction::FeatureVector;

/// Model inputs, in the order the detectors consume them
pub const FEATURES: [&str; 5] = [
    "amount",
    "hour",
    "distance",
    "device_score",
    "country_mismatch",
];

/// Label column of the training dataset (1 = fraud)
pub const TARGET: &str = "label";

/// Input dimensionality of both detectors
pub const FEATURE_COUNT: usize = FEATURES.len();

/// Turns feature vectors into dense model input.
pub struct FeatureExtractor;

impl FeatureExtractor {
    /// Create a new feature extractor.
    pub fn new() -> Self {
        Self
    }

    /// Vectorize in contract order; missing fields become 0.0.
    pub fn extract(&self, features: &FeatureVector) -> [f64; FEATURE_COUNT] {
        let mut row = [0.0; FEATURE_COUNT];
        for (slot, name) in row.iter_mut().zip(FEATURES) {
            *slot = features.get(name).unwrap_or(0.0);
        }
        row
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}
