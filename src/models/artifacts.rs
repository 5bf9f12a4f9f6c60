//! Artifact persistence shared by training and serving
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! reader sees either the previous complete file or the new one.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::autoencoder::{Autoencoder, AutoencoderParams};
use super::isolation_forest::IsolationForest;
use super::AnomalyDetector;
use crate::error::{PipelineError, Result};
use crate::feature_extractor::FEATURE_COUNT;
use crate::preprocess::StandardScaler;
use crate::training::TrainingReport;
use crate::types::score::DetectorKind;

pub const SCALER_FILE: &str = "scaler.json";
pub const ISOLATION_FOREST_FILE: &str = "isolation_forest.json";
pub const AUTOENCODER_FILE: &str = "autoencoder.json";
pub const THRESHOLD_FILE: &str = "threshold.json";
pub const TRAINING_REPORT_FILE: &str = "training_report.json";

/// Calibrated decision thresholds; an absent key means "not calibrated yet"
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso_thr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ae_thr: Option<f64>,
}

impl Thresholds {
    pub fn get(&self, detector: DetectorKind) -> Option<f64> {
        match detector {
            DetectorKind::IsolationForest => self.iso_thr,
            DetectorKind::Autoencoder => self.ae_thr,
        }
    }

    pub fn set(&mut self, detector: DetectorKind, value: f64) {
        match detector {
            DetectorKind::IsolationForest => self.iso_thr = Some(value),
            DetectorKind::Autoencoder => self.ae_thr = Some(value),
        }
    }
}

/// Everything serving needs, loaded together
#[derive(Debug, Clone)]
pub struct ArtifactBundle {
    pub scaler: StandardScaler,
    pub isolation_forest: Option<IsolationForest>,
    pub autoencoder: Option<Autoencoder>,
    pub thresholds: Thresholds,
}

/// Artifact directory manager
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Create the artifact directory
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        debug!(dir = %self.dir.display(), "Artifact directory ready");
        Ok(())
    }

    // === Scaler ===

    pub fn save_scaler(&self, scaler: &StandardScaler) -> Result<()> {
        self.write_json(SCALER_FILE, scaler)
    }

    /// Load standardization statistics; required for serving
    pub fn load_scaler(&self) -> Result<StandardScaler> {
        let scaler: StandardScaler = self
            .read_json(SCALER_FILE)?
            .ok_or_else(|| PipelineError::MissingArtifact(self.path(SCALER_FILE)))?;
        scaler.check_contract()?;
        Ok(scaler)
    }

    // === Detectors ===

    pub fn save_isolation_forest(&self, forest: &IsolationForest) -> Result<()> {
        if !forest.is_trained() {
            return Err(PipelineError::NotTrained {
                detector: "isolation_forest",
            });
        }
        self.write_json(ISOLATION_FOREST_FILE, forest)
    }

    /// `None` when no forest has been persisted
    pub fn load_isolation_forest(&self) -> Result<Option<IsolationForest>> {
        let forest: Option<IsolationForest> = self.read_json(ISOLATION_FOREST_FILE)?;
        match forest {
            Some(forest) if !forest.is_trained() => Err(PipelineError::NotTrained {
                detector: "isolation_forest",
            }),
            other => Ok(other),
        }
    }

    pub fn save_autoencoder(&self, model: &Autoencoder) -> Result<()> {
        if !model.is_trained() {
            return Err(PipelineError::NotTrained {
                detector: "autoencoder",
            });
        }
        self.write_json(AUTOENCODER_FILE, &model.params())
    }

    /// `None` when no parameters have been persisted
    pub fn load_autoencoder(&self) -> Result<Option<Autoencoder>> {
        let params: Option<AutoencoderParams> = self.read_json(AUTOENCODER_FILE)?;
        params
            .map(|params| Autoencoder::from_params(params, FEATURE_COUNT))
            .transpose()
    }

    // === Thresholds ===

    /// Replace the threshold file with `thresholds`
    pub fn write_thresholds(&self, thresholds: &Thresholds) -> Result<()> {
        self.write_json(THRESHOLD_FILE, thresholds)
    }

    /// Set one detector's threshold, keeping the others
    pub fn merge_threshold(&self, detector: DetectorKind, value: f64) -> Result<Thresholds> {
        let mut thresholds: Thresholds = self
            .read_json(THRESHOLD_FILE)?
            .ok_or_else(|| PipelineError::MissingArtifact(self.path(THRESHOLD_FILE)))?;
        thresholds.set(detector, value);
        self.write_json(THRESHOLD_FILE, &thresholds)?;
        Ok(thresholds)
    }

    /// Current thresholds; an absent file means none are calibrated
    pub fn load_thresholds(&self) -> Result<Thresholds> {
        Ok(self.read_json(THRESHOLD_FILE)?.unwrap_or_default())
    }

    // === Training runs ===

    /// Record the run that produced the current artifacts
    pub fn save_training_report(&self, report: &TrainingReport) -> Result<()> {
        self.write_json(TRAINING_REPORT_FILE, report)
    }

    /// `None` when the artifacts were not produced by a recorded run
    pub fn load_training_report(&self) -> Result<Option<TrainingReport>> {
        self.read_json(TRAINING_REPORT_FILE)
    }

    // === Bundle ===

    /// Load every artifact; absent detector files become `None`
    pub fn load_bundle(&self) -> Result<ArtifactBundle> {
        let bundle = ArtifactBundle {
            scaler: self.load_scaler()?,
            isolation_forest: self.load_isolation_forest()?,
            autoencoder: self.load_autoencoder()?,
            thresholds: self.load_thresholds()?,
        };

        info!(
            dir = %self.dir.display(),
            isolation_forest = bundle.isolation_forest.is_some(),
            autoencoder = bundle.autoencoder.is_some(),
            iso_thr = ?bundle.thresholds.iso_thr,
            ae_thr = ?bundle.thresholds.ae_thr,
            "Artifacts loaded"
        );
        Ok(bundle)
    }

    /// Persist every present artifact of `bundle`
    pub fn save_bundle(&self, bundle: &ArtifactBundle) -> Result<()> {
        self.save_scaler(&bundle.scaler)?;
        if let Some(forest) = &bundle.isolation_forest {
            self.save_isolation_forest(forest)?;
        }
        if let Some(model) = &bundle.autoencoder {
            self.save_autoencoder(model)?;
        }
        self.write_thresholds(&bundle.thresholds)
    }

    fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(file);

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, value)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!(path = %path.display(), "Artifact written");
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        let path = self.path(file);
        if !path.exists() {
            debug!(path = %path.display(), "Artifact not found");
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&path)?);
        Ok(Some(serde_json::from_reader(reader)?))
    }
}
