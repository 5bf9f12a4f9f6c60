//! Labeled transaction datasets: CSV I/O and synthetic generation.

use crate::error::{PipelineError, Result};
use crate::feature_extractor::{FEATURES, FEATURE_COUNT, TARGET};
use crate::types::transaction::FeatureVector;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Bernoulli, Distribution, Exp, Gamma};
use std::path::Path;
use tracing::debug;

/// Feature matrix in contract column order plus optional fraud labels
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    features: Array2<f64>,
    labels: Option<Vec<u8>>,
}

impl Dataset {
    /// Build from a `rows x FEATURE_COUNT` matrix and optional labels
    pub fn from_parts(features: Array2<f64>, labels: Option<Vec<u8>>) -> Result<Self> {
        if features.ncols() != FEATURE_COUNT {
            return Err(PipelineError::ArtifactShapeMismatch {
                expected: FEATURE_COUNT,
                found: features.ncols(),
            });
        }
        if let Some(labels) = &labels {
            if labels.len() != features.nrows() {
                return Err(PipelineError::invalid_parameter(
                    TARGET,
                    format!("{} labels for {} rows", labels.len(), features.nrows()),
                ));
            }
            if labels.iter().any(|&l| l > 1) {
                return Err(PipelineError::invalid_parameter(TARGET, "labels must be 0 or 1"));
            }
        }
        Ok(Self { features, labels })
    }

    /// Read a headered CSV; columns are matched by name, extra columns ignored
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();

        let column = |name: &str| headers.iter().position(|h| h.trim() == name);
        let mut feature_idx = [0usize; FEATURE_COUNT];
        for (slot, name) in feature_idx.iter_mut().zip(FEATURES) {
            *slot = column(name).ok_or_else(|| {
                PipelineError::invalid_parameter(name, format!("column missing in {}", path.display()))
            })?;
        }
        let label_idx = column(TARGET);

        let mut values = Vec::new();
        let mut labels = label_idx.map(|_| Vec::new());

        for (row, record) in reader.records().enumerate() {
            let record = record?;
            for (&idx, name) in feature_idx.iter().zip(FEATURES) {
                values.push(parse_field(&record, idx, name, row)?);
            }
            if let (Some(idx), Some(labels)) = (label_idx, labels.as_mut()) {
                let label = parse_field(&record, idx, TARGET, row)?;
                if label != 0.0 && label != 1.0 {
                    return Err(PipelineError::invalid_parameter(
                        TARGET,
                        format!("row {}: label {} is not 0 or 1", row + 1, label),
                    ));
                }
                labels.push(label as u8);
            }
        }

        let rows = values.len() / FEATURE_COUNT;
        let features = Array2::from_shape_vec((rows, FEATURE_COUNT), values)
            .map_err(|e| PipelineError::invalid_parameter("features", e.to_string()))?;

        debug!(path = %path.display(), rows, labeled = labels.is_some(), "Dataset loaded");
        Self::from_parts(features, labels)
    }

    /// Write the dataset with a header row in contract order
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut writer = csv::Writer::from_path(path)?;
        let mut header: Vec<&str> = FEATURES.to_vec();
        if self.labels.is_some() {
            header.push(TARGET);
        }
        writer.write_record(&header)?;

        for (i, row) in self.features.axis_iter(Axis(0)).enumerate() {
            let mut record: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            if let Some(labels) = &self.labels {
                record.push(labels[i].to_string());
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.features.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.features.nrows() == 0
    }

    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.features.row(index)
    }

    pub fn labels(&self) -> Option<&[u8]> {
        self.labels.as_deref()
    }

    /// Share of rows labeled fraud, if labeled
    pub fn positive_rate(&self) -> Option<f64> {
        let labels = self.labels.as_ref()?;
        if labels.is_empty() {
            return None;
        }
        Some(labels.iter().filter(|&&l| l == 1).count() as f64 / labels.len() as f64)
    }

    /// Rows at `indices`, in that order
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            features: self.features.select(Axis(0), indices),
            labels: self
                .labels
                .as_ref()
                .map(|labels| indices.iter().map(|&i| labels[i]).collect()),
        }
    }
}

fn parse_field(record: &csv::StringRecord, idx: usize, name: &str, row: usize) -> Result<f64> {
    let raw = record.get(idx).unwrap_or("").trim();
    raw.parse::<f64>().map_err(|_| {
        PipelineError::invalid_parameter(name, format!("row {}: cannot parse {:?}", row + 1, raw))
    })
}

/// Synthetic transaction generator.
///
/// Fraud probability is `sigmoid(z - 2.2)` with
/// `z = amount/120 + distance/5 + 1.5*device_score + 2*country_mismatch + 0.3*[hour % 3 == 0]`.
pub struct SyntheticGenerator {
    rng: ChaCha8Rng,
    amount: Gamma<f64>,
    distance: Exp<f64>,
    mismatch: Bernoulli,
}

impl SyntheticGenerator {
    pub fn new(seed: u64) -> Result<Self> {
        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            amount: Gamma::new(2.0, 40.0)
                .map_err(|e| PipelineError::invalid_parameter("amount", e.to_string()))?,
            distance: Exp::new(1.0 / 3.0)
                .map_err(|e| PipelineError::invalid_parameter("distance", e.to_string()))?,
            mismatch: Bernoulli::new(0.08)
                .map_err(|e| PipelineError::invalid_parameter("country_mismatch", e.to_string()))?,
        })
    }

    /// One transaction and its drawn label
    pub fn sample(&mut self) -> (FeatureVector, u8) {
        let amount = self.amount.sample(&mut self.rng);
        let hour = self.rng.gen_range(0..24) as f64;
        let distance = self.distance.sample(&mut self.rng);
        let device_score = self.rng.gen_range(0.0..1.0);
        let country_mismatch = if self.mismatch.sample(&mut self.rng) { 1.0 } else { 0.0 };

        let hour_bucket = if hour as u32 % 3 == 0 { 0.3 } else { 0.0 };
        let z = amount / 120.0
            + distance / 5.0
            + device_score * 1.5
            + country_mismatch * 2.0
            + hour_bucket;
        let prob_fraud = 1.0 / (1.0 + (-(z - 2.2)).exp());
        let label = u8::from(self.rng.gen_bool(prob_fraud.clamp(0.0, 1.0)));

        (
            FeatureVector::new(amount, hour, distance, device_score, country_mismatch),
            label,
        )
    }

    /// Daytime, nearby, low device risk, domestic card
    pub fn sample_legitimate(&mut self) -> FeatureVector {
        FeatureVector::new(
            self.amount.sample(&mut self.rng),
            self.rng.gen_range(7..23) as f64,
            self.distance.sample(&mut self.rng),
            self.rng.gen_range(0.0..0.6),
            0.0,
        )
    }

    /// Large night-time purchase far from home on a risky foreign device
    pub fn sample_suspicious(&mut self) -> FeatureVector {
        FeatureVector::new(
            self.rng.gen_range(600.0..3000.0),
            self.rng.gen_range(0..6) as f64,
            self.rng.gen_range(40.0..400.0),
            self.rng.gen_range(0.8..1.0),
            1.0,
        )
    }

    /// A labeled dataset of `rows` transactions drawn from the logistic model
    pub fn generate(&mut self, rows: usize) -> Dataset {
        let samples: Vec<(FeatureVector, u8)> = (0..rows).map(|_| self.sample()).collect();
        Self::collect(samples)
    }

    /// Logistic-model rows kept per class until `fraud_rate` of them are fraud.
    ///
    /// Classes overlap the way [`generate`](Self::generate) draws them; only the
    /// prevalence changes.
    pub fn generate_at_rate(&mut self, rows: usize, fraud_rate: f64) -> Dataset {
        let positives = (rows as f64 * fraud_rate.clamp(0.0, 1.0)).round() as usize;
        let negatives = rows - positives;
        let (mut fraud, mut legit) = (Vec::with_capacity(positives), Vec::with_capacity(negatives));
        while fraud.len() < positives || legit.len() < negatives {
            let (row, label) = self.sample();
            if label == 1 && fraud.len() < positives {
                fraud.push(row);
            } else if label == 0 && legit.len() < negatives {
                legit.push(row);
            }
        }

        let mut samples: Vec<(FeatureVector, u8)> = fraud
            .into_iter()
            .map(|row| (row, 1))
            .chain(legit.into_iter().map(|row| (row, 0)))
            .collect();
        samples.shuffle(&mut self.rng);
        Self::collect(samples)
    }

    /// A labeled dataset mixing legitimate rows with planted suspicious ones
    pub fn generate_mixed(&mut self, rows: usize, fraud_rate: f64) -> Dataset {
        let fraud_rate = fraud_rate.clamp(0.0, 1.0);
        let samples: Vec<(FeatureVector, u8)> = (0..rows)
            .map(|_| {
                if self.rng.gen_bool(fraud_rate) {
                    (self.sample_suspicious(), 1)
                } else {
                    (self.sample_legitimate(), 0)
                }
            })
            .collect();
        Self::collect(samples)
    }

    fn collect(samples: Vec<(FeatureVector, u8)>) -> Dataset {
        let mut features = Array2::zeros((samples.len(), FEATURE_COUNT));
        let mut labels = Vec::with_capacity(samples.len());
        for (mut out, (row, label)) in features.axis_iter_mut(Axis(0)).zip(samples) {
            for (slot, name) in out.iter_mut().zip(FEATURES) {
                *slot = row.get(name).unwrap_or(0.0);
            }
            labels.push(label);
        }
        Dataset {
            features,
            labels: Some(labels),
        }
    }
}
