//! Offline training: split, fit both detectors, calibrate, persist

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{AppConfig, AutoencoderConfig, IsolationForestConfig};
use crate::dataset::Dataset;
use crate::error::Result;
use crate::feature_extractor::FEATURE_COUNT;
use crate::models::artifacts::{ArtifactStore, Thresholds};
use crate::models::autoencoder::{Autoencoder, ComputeDevice};
use crate::models::calibration::{Calibration, ThresholdCalibrator};
use crate::models::isolation_forest::IsolationForest;
use crate::models::AnomalyDetector;
use crate::preprocess::DatasetSplitter;
use crate::types::score::DetectorKind;

/// Hyperparameters a detector was trained with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum DetectorParams {
    IsolationForest {
        n_estimators: usize,
        contamination: f64,
        max_samples: usize,
        seed: u64,
    },
    Autoencoder {
        hidden_dims: Vec<usize>,
        epochs: usize,
        lr: f64,
        batch_size: usize,
        seed: u64,
        device: ComputeDevice,
    },
}

impl DetectorParams {
    fn isolation_forest(config: &IsolationForestConfig) -> Self {
        DetectorParams::IsolationForest {
            n_estimators: config.n_trees,
            contamination: config.contamination,
            max_samples: config.max_samples,
            seed: config.seed,
        }
    }

    fn autoencoder(model: &Autoencoder) -> Self {
        let config = model.config();
        DetectorParams::Autoencoder {
            hidden_dims: config.hidden_dims.clone(),
            epochs: config.epochs,
            lr: config.learning_rate,
            batch_size: config.batch_size,
            seed: config.seed,
            device: model.device(),
        }
    }
}

/// Validation results for one detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorReport {
    pub detector: DetectorKind,
    pub params: DetectorParams,
    pub threshold: f64,
    /// Average precision of the binarized predictions at `threshold`
    pub metric: f64,
    pub roc_auc: Option<f64>,
    pub average_precision: f64,
}

impl DetectorReport {
    fn new(detector: DetectorKind, params: DetectorParams, calibration: Calibration) -> Self {
        Self {
            detector,
            params,
            threshold: calibration.threshold,
            metric: calibration.metric,
            roc_auc: calibration.roc_auc,
            average_precision: calibration.average_precision,
        }
    }

    fn log(&self) {
        let roc_auc = self
            .roc_auc
            .map(|auc| format!("{:.4}", auc))
            .unwrap_or_else(|| "n/a".to_string());
        info!(
            detector = %self.detector,
            params = ?self.params,
            metric = self.metric,
            average_precision = self.average_precision,
            "[{}] val ROC-AUC={} thr={:.6}",
            self.detector.prefix().to_uppercase(),
            roc_auc,
            self.threshold
        );
    }
}

/// Summary of a training run, persisted next to the artifacts it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub train_rows: usize,
    pub validation_rows: usize,
    pub validation_positives: usize,
    pub isolation_forest: DetectorReport,
    pub autoencoder: DetectorReport,
    /// Mean reconstruction loss of the last autoencoder epoch
    pub autoencoder_final_loss: Option<f64>,
}

impl TrainingReport {
    pub fn detector(&self, detector: DetectorKind) -> &DetectorReport {
        match detector {
            DetectorKind::IsolationForest => &self.isolation_forest,
            DetectorKind::Autoencoder => &self.autoencoder,
        }
    }
}

/// Trains and calibrates both detectors, then writes the artifact set
#[derive(Debug, Clone)]
pub struct Trainer {
    splitter: DatasetSplitter,
    isolation_forest: IsolationForestConfig,
    autoencoder: AutoencoderConfig,
    calibrator: ThresholdCalibrator,
}

impl Default for Trainer {
    fn default() -> Self {
        Self {
            splitter: DatasetSplitter::default(),
            isolation_forest: IsolationForestConfig::default(),
            autoencoder: AutoencoderConfig::default(),
            calibrator: ThresholdCalibrator::default(),
        }
    }
}

impl Trainer {
    pub fn new(
        splitter: DatasetSplitter,
        isolation_forest: IsolationForestConfig,
        autoencoder: AutoencoderConfig,
    ) -> Self {
        Self {
            splitter,
            isolation_forest,
            autoencoder,
            calibrator: ThresholdCalibrator::default(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let splitter = DatasetSplitter::new(
            config.training.validation_fraction,
            config.training.seed,
        )?;
        Ok(Self::new(
            splitter,
            config.detectors.isolation_forest.clone(),
            config.detectors.autoencoder.clone(),
        ))
    }

    /// Train from a CSV file into `out_dir`
    pub fn run<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        data_path: P,
        out_dir: Q,
    ) -> Result<TrainingReport> {
        let dataset = Dataset::from_csv(data_path.as_ref())?;
        info!(
            path = %data_path.as_ref().display(),
            rows = dataset.len(),
            positive_rate = ?dataset.positive_rate(),
            "Dataset loaded"
        );
        self.run_dataset(&dataset, &ArtifactStore::new(out_dir))
    }

    /// Train on an in-memory dataset, persisting into `store`.
    ///
    /// Nothing is written until both detectors are fitted and calibrated, so a
    /// failed run leaves the previous artifact set in place.
    pub fn run_dataset(&self, dataset: &Dataset, store: &ArtifactStore) -> Result<TrainingReport> {
        let split = self.splitter.split_and_scale(dataset)?;

        let mut forest = IsolationForest::new(self.isolation_forest.clone());
        forest.fit(split.train.view())?;
        let iso_scores = forest.score_batch(split.validation.view())?;
        let iso = DetectorReport::new(
            DetectorKind::IsolationForest,
            DetectorParams::isolation_forest(forest.config()),
            self.calibrator
                .calibrate(&iso_scores, &split.validation_labels)?,
        );
        iso.log();

        let mut autoencoder = Autoencoder::new(self.autoencoder.clone(), FEATURE_COUNT);
        let losses = autoencoder.fit(split.train.view())?;
        let ae_scores = autoencoder.score_batch(split.validation.view())?;
        let ae = DetectorReport::new(
            DetectorKind::Autoencoder,
            DetectorParams::autoencoder(&autoencoder),
            self.calibrator
                .calibrate(&ae_scores, &split.validation_labels)?,
        );
        ae.log();

        store.init()?;
        store.save_scaler(&split.scaler)?;
        store.save_isolation_forest(&forest)?;
        store.save_autoencoder(&autoencoder)?;
        store.write_thresholds(&Thresholds {
            iso_thr: Some(iso.threshold),
            ae_thr: None,
        })?;
        store.merge_threshold(DetectorKind::Autoencoder, ae.threshold)?;

        let report = TrainingReport {
            train_rows: split.train.nrows(),
            validation_rows: split.validation.nrows(),
            validation_positives: split.validation_labels.iter().filter(|&&l| l == 1).count(),
            isolation_forest: iso,
            autoencoder: ae,
            autoencoder_final_loss: losses.last().copied(),
        };
        store.save_training_report(&report)?;

        info!(
            dir = %store.dir().display(),
            train_rows = report.train_rows,
            validation_rows = report.validation_rows,
            "Training complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SyntheticGenerator;
    use crate::error::PipelineError;
    use crate::models::artifacts::{
        AUTOENCODER_FILE, ISOLATION_FOREST_FILE, SCALER_FILE, THRESHOLD_FILE,
        TRAINING_REPORT_FILE,
    };
    use crate::models::inference::ScoringEnsemble;
    use crate::types::transaction::FeatureVector;
    use std::fs;
    use tempfile::TempDir;

    const ARTIFACT_FILES: [&str; 5] = [
        SCALER_FILE,
        ISOLATION_FOREST_FILE,
        AUTOENCODER_FILE,
        THRESHOLD_FILE,
        TRAINING_REPORT_FILE,
    ];

    fn quick_trainer(autoencoder: AutoencoderConfig) -> Trainer {
        Trainer::new(
            DatasetSplitter::default(),
            IsolationForestConfig {
                n_trees: 30,
                ..IsolationForestConfig::default()
            },
            autoencoder,
        )
    }

    #[test]
    fn test_end_to_end_synthetic_run() {
        let temp = TempDir::new().unwrap();
        let data_path = temp.path().join("data").join("transactions.csv");
        let out_dir = temp.path().join("artifacts");

        SyntheticGenerator::new(42)
            .unwrap()
            .generate_at_rate(4000, 0.08)
            .to_csv(&data_path)
            .unwrap();

        let report = Trainer::default().run(&data_path, &out_dir).unwrap();

        assert_eq!(report.train_rows + report.validation_rows, 4000);
        assert!(report.validation_positives > 0);
        let best_auc = [DetectorKind::IsolationForest, DetectorKind::Autoencoder]
            .iter()
            .filter_map(|&kind| report.detector(kind).roc_auc)
            .fold(0.0, f64::max);
        assert!(best_auc > 0.6, "best ROC-AUC {}", best_auc);

        for file in ARTIFACT_FILES {
            assert!(out_dir.join(file).exists(), "{} missing", file);
        }

        let ensemble = ScoringEnsemble::load(&out_dir).unwrap();
        assert_eq!(
            ensemble.thresholds().iso_thr,
            Some(report.isolation_forest.threshold)
        );
        assert_eq!(
            ensemble.thresholds().ae_thr,
            Some(report.autoencoder.threshold)
        );

        let result = ensemble.score(&FeatureVector::new(2500.0, 2.0, 350.0, 0.95, 1.0));
        assert!(result.iso_score.is_some());
        assert!(result.ae_score.is_some());
        assert!(result.unavailable.is_empty());
    }

    #[test]
    fn test_run_is_deterministic() {
        let data = SyntheticGenerator::new(7).unwrap().generate_mixed(400, 0.1);
        let trainer = quick_trainer(AutoencoderConfig::default());

        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let a = trainer
            .run_dataset(&data, &ArtifactStore::new(first.path()))
            .unwrap();
        let b = trainer
            .run_dataset(&data, &ArtifactStore::new(second.path()))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_failed_retrain_keeps_previous_artifacts() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        let first = SyntheticGenerator::new(3).unwrap().generate_mixed(300, 0.1);
        quick_trainer(AutoencoderConfig::default())
            .run_dataset(&first, &store)
            .unwrap();
        let before: Vec<Vec<u8>> = ARTIFACT_FILES
            .iter()
            .map(|file| fs::read(store.path(file)).unwrap())
            .collect();

        // The forest trains fine; the autoencoder step then fails
        let second = SyntheticGenerator::new(4).unwrap().generate_mixed(300, 0.1);
        let failing = quick_trainer(AutoencoderConfig {
            batch_size: 0,
            ..AutoencoderConfig::default()
        });
        let err = failing.run_dataset(&second, &store).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter { .. }));

        for (file, bytes) in ARTIFACT_FILES.iter().zip(&before) {
            assert_eq!(&fs::read(store.path(file)).unwrap(), bytes, "{} changed", file);
        }
    }

    #[test]
    fn test_training_report_records_params() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        let data = SyntheticGenerator::new(9).unwrap().generate_mixed(300, 0.1);
        let report = quick_trainer(AutoencoderConfig {
            epochs: 3,
            ..AutoencoderConfig::default()
        })
        .run_dataset(&data, &store)
        .unwrap();

        assert_eq!(
            report.isolation_forest.params,
            DetectorParams::IsolationForest {
                n_estimators: 30,
                contamination: 0.06,
                max_samples: 256,
                seed: 42,
            }
        );
        match &report.autoencoder.params {
            DetectorParams::Autoencoder {
                epochs, lr, device, ..
            } => {
                assert_eq!(*epochs, 3);
                assert_eq!(*lr, 1e-3);
                assert_eq!(*device, ComputeDevice::detect());
            }
            other => panic!("unexpected params {:?}", other),
        }

        assert_eq!(store.load_training_report().unwrap(), Some(report));
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path(TRAINING_REPORT_FILE)).unwrap())
                .unwrap();
        assert_eq!(json["isolation_forest"]["params"]["model"], "isolation_forest");
        assert_eq!(json["autoencoder"]["params"]["model"], "autoencoder");
    }

    #[test]
    fn test_unlabeled_dataset_aborts_before_writing() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        let data = SyntheticGenerator::new(1).unwrap().generate(50);
        let unlabeled = Dataset::from_parts(data.features().to_owned(), None).unwrap();

        let err = Trainer::default()
            .run_dataset(&unlabeled, &store)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData(_)));
        assert!(!store.path(SCALER_FILE).exists());
    }

    #[test]
    fn test_from_config_rejects_bad_fraction() {
        let mut config = AppConfig::default();
        config.training.validation_fraction = 1.5;
        assert!(Trainer::from_config(&config).is_err());
    }
}
