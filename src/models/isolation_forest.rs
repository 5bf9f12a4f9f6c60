//! Isolation Forest implementation
//!
//! Anomalies are easier to isolate and thus have shorter path lengths in the
//! trees. Raw scores `2^(-E[h(x)] / c(psi))` are shifted by the contamination
//! quantile of the training scores, so positive values mark the expected
//! anomalous share.

use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::calibration::quantile;
use super::AnomalyDetector;
use crate::config::IsolationForestConfig;
use crate::error::{PipelineError, Result};
use crate::types::score::DetectorKind;
use ndarray::{ArrayView1, ArrayView2, Axis};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Isolation Forest model for anomaly detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    config: IsolationForestConfig,
    /// Individual isolation trees
    trees: Vec<IsolationTree>,
    /// Rows drawn per tree
    subsample_size: usize,
    /// Raw-score quantile at `1 - contamination` on the training data
    offset: f64,
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self::new(IsolationForestConfig::default())
    }
}

impl IsolationForest {
    /// Create an untrained forest
    pub fn new(config: IsolationForestConfig) -> Self {
        Self {
            config,
            trees: Vec::new(),
            subsample_size: 0,
            offset: 0.0,
        }
    }

    pub fn config(&self) -> &IsolationForestConfig {
        &self.config
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Expected path length of an unsuccessful BST search among `n` points
    fn average_path_length(n: usize) -> f64 {
        match n {
            0 | 1 => 0.0,
            2 => 1.0,
            _ => {
                let n = n as f64;
                2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
            }
        }
    }

    /// Train on standardized rows; labels are never seen
    pub fn fit(&mut self, data: ArrayView2<'_, f64>) -> Result<()> {
        let IsolationForestConfig {
            n_trees,
            contamination,
            max_samples,
            seed,
        } = self.config;

        if n_trees == 0 || max_samples == 0 {
            return Err(PipelineError::invalid_parameter(
                "isolation_forest",
                "n_trees and max_samples must be positive",
            ));
        }
        if !(contamination > 0.0 && contamination <= 0.5) {
            return Err(PipelineError::invalid_parameter(
                "contamination",
                format!("{} is outside (0, 0.5]", contamination),
            ));
        }
        if data.nrows() == 0 {
            return Err(PipelineError::InsufficientData(
                "isolation forest needs at least one training row".into(),
            ));
        }

        let subsample_size = max_samples.min(data.nrows());
        let max_depth = (subsample_size as f64).log2().ceil() as usize;

        // Per-tree seeds keep the forest identical regardless of thread scheduling
        let mut master = ChaCha8Rng::seed_from_u64(seed);
        let tree_seeds: Vec<u64> = (0..n_trees).map(|_| master.gen()).collect();

        self.trees = tree_seeds
            .into_par_iter()
            .map(|tree_seed| {
                let mut rng = ChaCha8Rng::seed_from_u64(tree_seed);
                let mut sample = index::sample(&mut rng, data.nrows(), subsample_size).into_vec();
                IsolationTree::build(data, &mut sample, max_depth, &mut rng)
            })
            .collect();
        self.subsample_size = subsample_size;
        self.offset = 0.0;

        let raw: Vec<f64> = data
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| self.raw_score(row))
            .collect();
        self.offset = quantile(&raw, 1.0 - contamination);

        info!(
            n_trees,
            subsample_size,
            max_depth,
            offset = self.offset,
            "Isolation forest trained"
        );
        Ok(())
    }

    /// Unshifted isolation score in (0, 1]
    fn raw_score(&self, row: ArrayView1<'_, f64>) -> f64 {
        let total_path_length: f64 = self.trees.iter().map(|tree| tree.path_length(row)).sum();
        let avg_path = total_path_length / self.trees.len() as f64;
        let normalizer = Self::average_path_length(self.subsample_size);
        if normalizer == 0.0 {
            return 1.0;
        }
        2.0_f64.powf(-avg_path / normalizer)
    }
}

impl AnomalyDetector for IsolationForest {
    fn kind(&self) -> DetectorKind {
        DetectorKind::IsolationForest
    }

    fn is_trained(&self) -> bool {
        !self.trees.is_empty()
    }

    fn score(&self, row: ArrayView1<'_, f64>) -> Result<f64> {
        if !self.is_trained() {
            return Err(PipelineError::NotTrained {
                detector: "isolation_forest",
            });
        }
        Ok(self.raw_score(row) - self.offset)
    }

    fn score_batch(&self, rows: ArrayView2<'_, f64>) -> Result<Vec<f64>> {
        if !self.is_trained() {
            return Err(PipelineError::NotTrained {
                detector: "isolation_forest",
            });
        }
        let scores = rows
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| self.raw_score(row) - self.offset)
            .collect::<Vec<_>>();
        debug!(rows = scores.len(), "Isolation forest batch scored");
        Ok(scores)
    }
}

/// A single isolation tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationTree {
    root: IsolationNode,
}

impl IsolationTree {
    /// Build an isolation tree over the rows at `sample`
    fn build<R: Rng>(
        data: ArrayView2<'_, f64>,
        sample: &mut [usize],
        max_depth: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            root: Self::build_node(data, sample, 0, max_depth, rng),
        }
    }

    fn build_node<R: Rng>(
        data: ArrayView2<'_, f64>,
        sample: &mut [usize],
        depth: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> IsolationNode {
        if depth >= max_depth || sample.len() <= 1 {
            return IsolationNode::Leaf { size: sample.len() };
        }

        // Only features that still vary inside this node can split it
        let splittable: Vec<(usize, f64, f64)> = (0..data.ncols())
            .filter_map(|feature| {
                let (min, max) = sample.iter().fold((f64::MAX, f64::MIN), |(lo, hi), &i| {
                    let v = data[[i, feature]];
                    (lo.min(v), hi.max(v))
                });
                (max > min).then_some((feature, min, max))
            })
            .collect();

        if splittable.is_empty() {
            return IsolationNode::Leaf { size: sample.len() };
        }

        let (feature, min, max) = splittable[rng.gen_range(0..splittable.len())];
        let split_value = rng.gen_range(min..max);

        // In-place partition: rows <= split_value first. Both sides are non-empty
        // because min <= split_value < max.
        let mut boundary = 0;
        for i in 0..sample.len() {
            if data[[sample[i], feature]] <= split_value {
                sample.swap(i, boundary);
                boundary += 1;
            }
        }
        let (left, right) = sample.split_at_mut(boundary);

        IsolationNode::Internal {
            feature,
            split_value,
            left: Box::new(Self::build_node(data, left, depth + 1, max_depth, rng)),
            right: Box::new(Self::build_node(data, right, depth + 1, max_depth, rng)),
        }
    }

    /// Depth at which `row` lands, adjusted for unresolved leaf size
    fn path_length(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut node = &self.root;
        let mut depth = 0usize;
        loop {
            match node {
                IsolationNode::Leaf { size } => {
                    return depth as f64 + IsolationForest::average_path_length(*size);
                }
                IsolationNode::Internal {
                    feature,
                    split_value,
                    left,
                    right,
                } => {
                    node = if row[*feature] <= *split_value {
                        left.as_ref()
                    } else {
                        right.as_ref()
                    };
                    depth += 1;
                }
            }
        }
    }
}

/// Node in an isolation tree
#[derive(Debug, Clone, Serialize, Deserialize)]
enum IsolationNode {
    Internal {
        feature: usize,
        split_value: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
    Leaf {
        size: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};
    use rand_distr::{Distribution, Normal};

    fn small_config(n_trees: usize) -> IsolationForestConfig {
        IsolationForestConfig {
            n_trees,
            ..IsolationForestConfig::default()
        }
    }

    fn cluster(rows: usize) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let normal = Normal::new(0.0, 1.0).unwrap();
        Array2::from_shape_fn((rows, 5), |_| normal.sample(&mut rng))
    }

    #[test]
    fn test_isolation_forest_creation() {
        let forest = IsolationForest::default();
        assert!(!forest.is_trained());
        assert_eq!(forest.kind(), DetectorKind::IsolationForest);
        assert_eq!(forest.config().n_trees, 200);
    }

    #[test]
    fn test_score_before_fit_is_not_trained() {
        let forest = IsolationForest::default();
        let err = forest.score(array![0.0, 0.0, 0.0, 0.0, 0.0].view()).unwrap_err();
        assert!(matches!(err, PipelineError::NotTrained { .. }));
        assert!(forest.score_batch(cluster(3).view()).is_err());
    }

    #[test]
    fn test_isolation_forest_training() {
        let mut forest = IsolationForest::new(small_config(10));
        forest.fit(cluster(100).view()).unwrap();

        assert!(forest.is_trained());
        assert_eq!(forest.n_trees(), 10);
    }

    #[test]
    fn test_outlier_scores_higher() {
        let mut forest = IsolationForest::new(small_config(100));
        forest.fit(cluster(300).view()).unwrap();

        let normal = forest.score(array![0.0, 0.0, 0.0, 0.0, 0.0].view()).unwrap();
        let outlier = forest.score(array![8.0, -6.0, 9.0, 7.0, 5.0].view()).unwrap();
        assert!(outlier > normal, "outlier {} <= normal {}", outlier, normal);
        assert!(outlier > 0.0);
    }

    #[test]
    fn test_contamination_offset_flags_expected_share() {
        let data = cluster(400);
        let mut forest = IsolationForest::new(small_config(50));
        forest.fit(data.view()).unwrap();

        let scores = forest.score_batch(data.view()).unwrap();
        let positive = scores.iter().filter(|&&s| s > 0.0).count() as f64 / scores.len() as f64;
        assert!(positive <= 0.06 + 1e-9, "positive share {}", positive);
    }

    #[test]
    fn test_same_seed_reproduces_scores() {
        let data = cluster(200);
        let mut a = IsolationForest::new(small_config(30));
        let mut b = IsolationForest::new(small_config(30));
        a.fit(data.view()).unwrap();
        b.fit(data.view()).unwrap();

        assert_eq!(
            a.score_batch(data.view()).unwrap(),
            b.score_batch(data.view()).unwrap()
        );
    }

    #[test]
    fn test_batch_matches_single_row_scores() {
        let data = cluster(50);
        let mut forest = IsolationForest::new(small_config(20));
        forest.fit(data.view()).unwrap();

        let batch = forest.score_batch(data.view()).unwrap();
        for (i, row) in data.axis_iter(Axis(0)).enumerate() {
            assert_eq!(forest.score(row).unwrap(), batch[i]);
        }
    }

    #[test]
    fn test_single_row_fit_is_degenerate_but_valid() {
        let mut forest = IsolationForest::new(small_config(5));
        forest.fit(array![[1.0, 2.0, 3.0, 0.5, 0.0]].view()).unwrap();
        let score = forest.score(array![1.0, 2.0, 3.0, 0.5, 0.0].view()).unwrap();
        assert!(score.abs() < 1e-12);
    }

    #[test]
    fn test_rejects_invalid_contamination() {
        let mut forest = IsolationForest::new(IsolationForestConfig {
            contamination: 0.9,
            ..IsolationForestConfig::default()
        });
        assert!(forest.fit(cluster(10).view()).is_err());
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(IsolationForest::average_path_length(1), 0.0);
        assert_eq!(IsolationForest::average_path_length(2), 1.0);

        let c_10 = IsolationForest::average_path_length(10);
        let c_256 = IsolationForest::average_path_length(256);
        assert!(c_256 > c_10, "c(256)={} should be > c(10)={}", c_256, c_10);
    }
}
