//! Two-detector scoring ensemble used by the serving path

use crate::error::Result;
use crate::feature_extractor::{FeatureExtractor, FEATURE_COUNT};
use crate::models::artifacts::{ArtifactBundle, ArtifactStore, Thresholds};
use crate::models::autoencoder::Autoencoder;
use crate::models::isolation_forest::IsolationForest;
use crate::models::AnomalyDetector;
use crate::preprocess::StandardScaler;
use crate::types::score::{DetectorKind, DetectorOutcome, ScoringResult};
use crate::types::transaction::FeatureVector;
use ndarray::{Array2, ArrayView1, ArrayView2};
use std::path::Path;
use tracing::{debug, info, warn};

/// A loaded detector, or why it cannot score
type DetectorSlot<T> = std::result::Result<T, String>;

/// Frozen scaler, detectors and thresholds.
///
/// Loaded once and shared read-only; every method takes `&self`.
pub struct ScoringEnsemble {
    extractor: FeatureExtractor,
    scaler: StandardScaler,
    isolation_forest: DetectorSlot<IsolationForest>,
    autoencoder: DetectorSlot<Autoencoder>,
    thresholds: Thresholds,
}

impl ScoringEnsemble {
    /// Load artifacts from `dir`.
    ///
    /// The scaler is required. A detector whose file is absent or unreadable
    /// is kept as unavailable so the other one keeps scoring.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let store = ArtifactStore::new(dir);
        let scaler = store.load_scaler()?;
        let thresholds = store.load_thresholds()?;

        let isolation_forest = slot(
            DetectorKind::IsolationForest,
            store.load_isolation_forest(),
            &store,
        );
        let autoencoder = slot(DetectorKind::Autoencoder, store.load_autoencoder(), &store);

        let ensemble = Self {
            extractor: FeatureExtractor::new(),
            scaler,
            isolation_forest,
            autoencoder,
            thresholds,
        };
        ensemble.log_loaded(store.dir());
        Ok(ensemble)
    }

    /// Build from artifacts already in memory
    pub fn from_bundle(bundle: ArtifactBundle) -> Result<Self> {
        bundle.scaler.check_contract()?;
        Ok(Self {
            extractor: FeatureExtractor::new(),
            scaler: bundle.scaler,
            isolation_forest: bundle
                .isolation_forest
                .ok_or_else(|| "isolation forest not loaded".to_string()),
            autoencoder: bundle
                .autoencoder
                .ok_or_else(|| "autoencoder not loaded".to_string()),
            thresholds: bundle.thresholds,
        })
    }

    fn log_loaded(&self, dir: &Path) {
        info!(
            dir = %dir.display(),
            isolation_forest = self.is_available(DetectorKind::IsolationForest),
            autoencoder = self.is_available(DetectorKind::Autoencoder),
            iso_thr = ?self.thresholds.iso_thr,
            ae_thr = ?self.thresholds.ae_thr,
            "Scoring ensemble initialized"
        );
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Check if a detector loaded and can score
    pub fn is_available(&self, detector: DetectorKind) -> bool {
        match detector {
            DetectorKind::IsolationForest => self.isolation_forest.is_ok(),
            DetectorKind::Autoencoder => self.autoencoder.is_ok(),
        }
    }

    /// Score one transaction with both detectors
    pub fn score(&self, features: &FeatureVector) -> ScoringResult {
        let raw = self.extractor.extract(features);
        let row = self.scaler.transform_row(&raw);

        let iso = outcome(&self.isolation_forest, row.view());
        let ae = outcome(&self.autoencoder, row.view());

        debug!(iso = ?iso, ae = ?ae, "Transaction scored");
        ScoringResult::from_outcomes(iso, self.thresholds.iso_thr, ae, self.thresholds.ae_thr)
    }

    /// Score many transactions with one vectorized pass per detector
    pub fn score_batch(&self, batch: &[FeatureVector]) -> Vec<ScoringResult> {
        let rows: Vec<[f64; FEATURE_COUNT]> =
            batch.iter().map(|f| self.extractor.extract(f)).collect();
        let raw = Array2::from_shape_fn((rows.len(), FEATURE_COUNT), |(i, j)| rows[i][j]);
        let scaled = self.scaler.transform(raw.view());

        let iso = batch_outcomes(&self.isolation_forest, scaled.view());
        let ae = batch_outcomes(&self.autoencoder, scaled.view());

        iso.into_iter()
            .zip(ae)
            .map(|(iso, ae)| {
                ScoringResult::from_outcomes(
                    iso,
                    self.thresholds.iso_thr,
                    ae,
                    self.thresholds.ae_thr,
                )
            })
            .collect()
    }
}

fn slot<T>(
    detector: DetectorKind,
    loaded: Result<Option<T>>,
    store: &ArtifactStore,
) -> DetectorSlot<T> {
    match loaded {
        Ok(Some(model)) => Ok(model),
        Ok(None) => {
            warn!(detector = %detector, dir = %store.dir().display(), "Detector artifact not found");
            Err(format!("{} artifact not found", detector))
        }
        Err(e) => {
            warn!(detector = %detector, error = %e, "Failed to load detector, marking unavailable");
            Err(e.to_string())
        }
    }
}

fn outcome<D: AnomalyDetector>(slot: &DetectorSlot<D>, row: ArrayView1<'_, f64>) -> DetectorOutcome {
    match slot {
        Ok(detector) => match detector.score(row) {
            Ok(score) if score.is_finite() => DetectorOutcome::Scored(score),
            Ok(score) => DetectorOutcome::Unavailable(format!("non-finite score {}", score)),
            Err(e) => {
                warn!(detector = %detector.kind(), error = %e, "Detector scoring failed");
                DetectorOutcome::Unavailable(e.to_string())
            }
        },
        Err(reason) => DetectorOutcome::Unavailable(reason.clone()),
    }
}

fn batch_outcomes<D: AnomalyDetector>(
    slot: &DetectorSlot<D>,
    rows: ArrayView2<'_, f64>,
) -> Vec<DetectorOutcome> {
    let unavailable = |reason: String| vec![DetectorOutcome::Unavailable(reason); rows.nrows()];
    match slot {
        Ok(detector) => match detector.score_batch(rows) {
            Ok(scores) => scores
                .into_iter()
                .map(|score| {
                    if score.is_finite() {
                        DetectorOutcome::Scored(score)
                    } else {
                        DetectorOutcome::Unavailable(format!("non-finite score {}", score))
                    }
                })
                .collect(),
            Err(e) => {
                warn!(detector = %detector.kind(), error = %e, "Detector batch scoring failed");
                unavailable(e.to_string())
            }
        },
        Err(reason) => unavailable(reason.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoencoderConfig, IsolationForestConfig};
    use crate::dataset::SyntheticGenerator;
    use crate::models::artifacts::AUTOENCODER_FILE;
    use crate::preprocess::DatasetSplitter;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn trained_bundle(thresholds: Thresholds) -> ArtifactBundle {
        let data = SyntheticGenerator::new(21).unwrap().generate_mixed(300, 0.08);
        let split = DatasetSplitter::default().split_and_scale(&data).unwrap();

        let mut forest = IsolationForest::new(IsolationForestConfig {
            n_trees: 20,
            ..IsolationForestConfig::default()
        });
        forest.fit(split.train.view()).unwrap();
        let mut model = Autoencoder::new(AutoencoderConfig::default(), FEATURE_COUNT);
        model.fit(split.train.view()).unwrap();

        ArtifactBundle {
            scaler: split.scaler,
            isolation_forest: Some(forest),
            autoencoder: Some(model),
            thresholds,
        }
    }

    fn sample_features() -> FeatureVector {
        FeatureVector::new(120.0, 14.0, 3.5, 0.2, 0.0)
    }

    #[test]
    fn test_no_thresholds_never_flags() {
        let ensemble = ScoringEnsemble::from_bundle(trained_bundle(Thresholds::default())).unwrap();
        let suspicious = FeatureVector::new(3000.0, 3.0, 400.0, 0.99, 1.0);

        let result = ensemble.score(&suspicious);
        assert!(result.iso_score.is_some());
        assert!(result.ae_score.is_some());
        assert_eq!(result.iso_flag, 0);
        assert_eq!(result.ae_flag, 0);
        assert!(result.unavailable.is_empty());
    }

    #[test]
    fn test_thresholds_drive_flags() {
        let thresholds = Thresholds {
            iso_thr: Some(-10.0),
            ae_thr: Some(f64::MAX),
        };
        let ensemble = ScoringEnsemble::from_bundle(trained_bundle(thresholds)).unwrap();

        let result = ensemble.score(&sample_features());
        assert_eq!(result.iso_flag, 1);
        assert_eq!(result.ae_flag, 0);
        assert!(result.any_flag());
    }

    #[test]
    fn test_missing_device_score_is_zero_filled() {
        let ensemble = ScoringEnsemble::from_bundle(trained_bundle(Thresholds::default())).unwrap();
        let mut partial = sample_features();
        partial.device_score = None;
        let explicit = FeatureVector::new(120.0, 14.0, 3.5, 0.0, 0.0);

        assert_eq!(ensemble.score(&partial), ensemble.score(&explicit));
    }

    #[test]
    fn test_absent_detector_is_unavailable() {
        let mut bundle = trained_bundle(Thresholds {
            iso_thr: Some(-10.0),
            ae_thr: Some(0.0),
        });
        bundle.autoencoder = None;
        let ensemble = ScoringEnsemble::from_bundle(bundle).unwrap();
        assert!(!ensemble.is_available(DetectorKind::Autoencoder));

        let result = ensemble.score(&sample_features());
        assert!(result.iso_score.is_some());
        assert_eq!(result.iso_flag, 1);
        assert_eq!(result.ae_score, None);
        assert_eq!(result.ae_flag, 0);
        assert_eq!(result.unavailable.len(), 1);
        assert_eq!(result.unavailable[0].detector, DetectorKind::Autoencoder);
    }

    #[test]
    fn test_batch_matches_single_scores() {
        let ensemble = ScoringEnsemble::from_bundle(trained_bundle(Thresholds {
            iso_thr: Some(0.0),
            ae_thr: Some(1.0),
        }))
        .unwrap();
        let mut generator = SyntheticGenerator::new(8).unwrap();
        let batch: Vec<FeatureVector> = (0..40).map(|_| generator.sample().0).collect();

        let batched = ensemble.score_batch(&batch);
        assert_eq!(batched.len(), 40);
        for (features, result) in batch.iter().zip(&batched) {
            let single = ensemble.score(features);
            assert_eq!(single.iso_flag, result.iso_flag);
            assert_eq!(single.ae_flag, result.ae_flag);
            assert!((single.iso_score.unwrap() - result.iso_score.unwrap()).abs() < 1e-9);
            assert!((single.ae_score.unwrap() - result.ae_score.unwrap()).abs() < 1e-9);
        }
    }

    #[test]
    fn test_ensemble_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ScoringEnsemble>();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scoring_on_blocking_pool_matches_inline() {
        let ensemble =
            Arc::new(ScoringEnsemble::from_bundle(trained_bundle(Thresholds::default())).unwrap());
        let expected = ensemble.score(&sample_features());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let ensemble = Arc::clone(&ensemble);
                let features = sample_features();
                tokio::task::spawn_blocking(move || ensemble.score(&features))
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), expected);
        }
    }

    #[test]
    fn test_concurrent_scoring_is_consistent() {
        let ensemble =
            Arc::new(ScoringEnsemble::from_bundle(trained_bundle(Thresholds::default())).unwrap());
        let expected = ensemble.score(&sample_features());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ensemble = Arc::clone(&ensemble);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| ensemble.score(&sample_features()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for handle in handles {
            for result in handle.join().unwrap() {
                assert_eq!(result, expected);
            }
        }
    }

    #[test]
    fn test_load_marks_corrupt_detector_unavailable() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        store
            .save_bundle(&trained_bundle(Thresholds {
                iso_thr: Some(0.0),
                ae_thr: None,
            }))
            .unwrap();
        std::fs::write(store.path(AUTOENCODER_FILE), "{ not json").unwrap();

        let ensemble = ScoringEnsemble::load(temp.path()).unwrap();
        assert!(ensemble.is_available(DetectorKind::IsolationForest));
        assert!(!ensemble.is_available(DetectorKind::Autoencoder));
        assert_eq!(ensemble.thresholds().iso_thr, Some(0.0));

        let result = ensemble.score(&sample_features());
        assert!(result.iso_score.is_some());
        assert!(result.ae_score.is_none());
    }
}
