//! Stratified train/validation split and feature standardization.

use crate::dataset::Dataset;
use crate::error::{PipelineError, Result};
use crate::feature_extractor::{FEATURES, FEATURE_COUNT, TARGET};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-feature centering and scaling fit on a reference partition.
///
/// Uses the population standard deviation; constant features scale by 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    features: Vec<String>,
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(data: ArrayView2<'_, f64>) -> Result<Self> {
        if data.ncols() != FEATURE_COUNT {
            return Err(PipelineError::ArtifactShapeMismatch {
                expected: FEATURE_COUNT,
                found: data.ncols(),
            });
        }
        let mean = data
            .mean_axis(Axis(0))
            .ok_or_else(|| PipelineError::InsufficientData("cannot fit scaler on 0 rows".into()))?;
        let scale = data
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s == 0.0 || !s.is_finite() { 1.0 } else { s });

        Ok(Self {
            features: FEATURES.iter().map(|f| f.to_string()).collect(),
            mean: mean.to_vec(),
            scale: scale.to_vec(),
        })
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }

    pub fn transform(&self, data: ArrayView2<'_, f64>) -> Array2<f64> {
        let mean = ArrayView1::from(&self.mean[..]);
        let scale = ArrayView1::from(&self.scale[..]);
        (&data - &mean) / &scale
    }

    pub fn transform_row(&self, row: &[f64]) -> Array1<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (m, s))| (x - m) / s)
            .collect()
    }

    /// Reject statistics recorded for a different feature contract
    pub fn check_contract(&self) -> Result<()> {
        let found = self.mean.len().max(self.scale.len()).max(self.features.len());
        if self.mean.len() != FEATURE_COUNT
            || self.scale.len() != FEATURE_COUNT
            || self.features.iter().map(String::as_str).ne(FEATURES)
        {
            return Err(PipelineError::ArtifactShapeMismatch {
                expected: FEATURE_COUNT,
                found,
            });
        }
        Ok(())
    }
}

/// Scaled partitions ready for detector training and calibration
#[derive(Debug, Clone)]
pub struct PreparedSplit {
    pub train: Array2<f64>,
    pub validation: Array2<f64>,
    pub train_labels: Vec<u8>,
    pub validation_labels: Vec<u8>,
    pub scaler: StandardScaler,
}

/// Deterministic stratified splitter
#[derive(Debug, Clone, Copy)]
pub struct DatasetSplitter {
    validation_fraction: f64,
    seed: u64,
}

impl Default for DatasetSplitter {
    fn default() -> Self {
        Self {
            validation_fraction: 0.2,
            seed: 42,
        }
    }
}

impl DatasetSplitter {
    pub fn new(validation_fraction: f64, seed: u64) -> Result<Self> {
        if !(validation_fraction > 0.0 && validation_fraction < 1.0) {
            return Err(PipelineError::invalid_parameter(
                "validation_fraction",
                format!("{} is outside (0, 1)", validation_fraction),
            ));
        }
        Ok(Self {
            validation_fraction,
            seed,
        })
    }

    /// Partition row indices so each class keeps its share in both halves.
    ///
    /// Each class with `n` rows sends `round(n * fraction)` rows to validation,
    /// clamped so both partitions keep at least one row of it.
    pub fn split_indices(&self, labels: &[u8]) -> Result<(Vec<usize>, Vec<usize>)> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut train = Vec::new();
        let mut validation = Vec::new();

        for class in [0u8, 1] {
            let mut members: Vec<usize> = labels
                .iter()
                .enumerate()
                .filter(|(_, &l)| l == class)
                .map(|(i, _)| i)
                .collect();
            if members.is_empty() {
                continue;
            }
            if members.len() < 2 {
                return Err(PipelineError::InsufficientData(format!(
                    "class {} has {} row(s); stratifying needs at least 2",
                    class,
                    members.len()
                )));
            }

            let n_val = ((members.len() as f64 * self.validation_fraction).round() as usize)
                .clamp(1, members.len() - 1);
            members.shuffle(&mut rng);
            validation.extend_from_slice(&members[..n_val]);
            train.extend_from_slice(&members[n_val..]);
        }

        if train.is_empty() || validation.is_empty() {
            return Err(PipelineError::InsufficientData(format!(
                "{} row(s) cannot be split",
                labels.len()
            )));
        }

        train.shuffle(&mut rng);
        validation.shuffle(&mut rng);
        Ok((train, validation))
    }

    /// Split, fit the scaler on the training partition, scale both partitions
    pub fn split_and_scale(&self, dataset: &Dataset) -> Result<PreparedSplit> {
        let labels = dataset.labels().ok_or_else(|| {
            PipelineError::InsufficientData(format!("dataset has no `{}` column", TARGET))
        })?;
        let (train_idx, val_idx) = self.split_indices(labels)?;

        let train = dataset.select(&train_idx);
        let validation = dataset.select(&val_idx);
        let scaler = StandardScaler::fit(train.features())?;

        debug!(
            train_rows = train.len(),
            validation_rows = validation.len(),
            seed = self.seed,
            "Stratified split complete"
        );

        Ok(PreparedSplit {
            train: scaler.transform(train.features()),
            validation: scaler.transform(validation.features()),
            train_labels: train.labels().map(<[u8]>::to_vec).unwrap_or_default(),
            validation_labels: validation.labels().map(<[u8]>::to_vec).unwrap_or_default(),
            scaler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SyntheticGenerator;
    use ndarray::array;

    fn positives(labels: &[u8]) -> usize {
        labels.iter().filter(|&&l| l == 1).count()
    }

    #[test]
    fn test_split_preserves_class_proportions() {
        let data = SyntheticGenerator::new(1).unwrap().generate_mixed(1000, 0.08);
        let total_pos = positives(data.labels().unwrap());

        for fraction in [0.1, 0.2, 0.35, 0.5, 0.8] {
            let split = DatasetSplitter::new(fraction, 42)
                .unwrap()
                .split_and_scale(&data)
                .unwrap();

            assert_eq!(split.train.nrows() + split.validation.nrows(), 1000);
            let expected_val_pos = (total_pos as f64 * fraction).round() as usize;
            assert_eq!(positives(&split.validation_labels), expected_val_pos);
            assert_eq!(
                positives(&split.train_labels),
                total_pos - expected_val_pos
            );
        }
    }

    #[test]
    fn test_split_is_deterministic() {
        let labels: Vec<u8> = (0..200).map(|i| u8::from(i % 10 == 0)).collect();
        let splitter = DatasetSplitter::new(0.2, 42).unwrap();
        assert_eq!(
            splitter.split_indices(&labels).unwrap(),
            splitter.split_indices(&labels).unwrap()
        );

        let other = DatasetSplitter::new(0.2, 43).unwrap();
        assert_ne!(
            splitter.split_indices(&labels).unwrap(),
            other.split_indices(&labels).unwrap()
        );
    }

    #[test]
    fn test_split_rejects_singleton_class() {
        let mut labels = vec![0u8; 50];
        labels[7] = 1;
        let err = DatasetSplitter::default().split_indices(&labels).unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData(_)));
    }

    #[test]
    fn test_split_rejects_bad_fraction() {
        assert!(DatasetSplitter::new(0.0, 1).is_err());
        assert!(DatasetSplitter::new(1.0, 1).is_err());
        assert!(DatasetSplitter::new(f64::NAN, 1).is_err());
    }

    #[test]
    fn test_unlabeled_dataset_cannot_split() {
        let data = Dataset::from_parts(array![[1.0, 2.0, 3.0, 0.5, 0.0]], None).unwrap();
        assert!(DatasetSplitter::default().split_and_scale(&data).is_err());
    }

    #[test]
    fn test_scaler_ignores_validation_rows() {
        let data = SyntheticGenerator::new(5).unwrap().generate_mixed(300, 0.1);
        let splitter = DatasetSplitter::default();
        let (_, val_idx) = splitter.split_indices(data.labels().unwrap()).unwrap();
        let before = splitter.split_and_scale(&data).unwrap();

        let mut features = data.features().to_owned();
        for &i in &val_idx {
            features.row_mut(i).fill(1.0e6);
        }
        let perturbed = Dataset::from_parts(features, data.labels().map(<[u8]>::to_vec)).unwrap();
        let after = splitter.split_and_scale(&perturbed).unwrap();

        assert_eq!(before.scaler, after.scaler);
        assert_eq!(before.train, after.train);
        assert_ne!(before.validation, after.validation);
    }

    #[test]
    fn test_scaler_statistics() {
        let data = array![[0.0, 1.0, 2.0, 0.5, 1.0], [2.0, 3.0, 2.0, 0.5, 0.0]];
        let scaler = StandardScaler::fit(data.view()).unwrap();

        assert_eq!(scaler.mean(), &[1.0, 2.0, 2.0, 0.5, 0.5]);
        assert_eq!(scaler.scale(), &[1.0, 1.0, 1.0, 1.0, 0.5]);

        let scaled = scaler.transform(data.view());
        assert_eq!(scaled.row(0).to_vec(), vec![-1.0, -1.0, 0.0, 0.0, 1.0]);
        assert_eq!(
            scaler.transform_row(&[2.0, 3.0, 2.0, 0.5, 0.0]).to_vec(),
            scaled.row(1).to_vec()
        );
        assert!(scaler.check_contract().is_ok());
    }
}
