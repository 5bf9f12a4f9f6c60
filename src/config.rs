//! Configuration management for the fraud anomaly pipeline

use anyhow::{Context, Result};
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub nats: NatsConfig,
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub detectors: DetectorsConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// NATS connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,
    /// Subject for incoming transactions
    pub transaction_subject: String,
    /// Subject for outgoing score reports
    pub score_subject: String,
}

/// Artifact location shared by training and serving
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsConfig {
    /// Directory holding scaler, detector and threshold files
    pub dir: PathBuf,
}

/// Train/validation split settings
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    /// Share of each class moved to the validation partition
    #[serde(default = "default_validation_fraction")]
    pub validation_fraction: f64,
    /// Seed for the stratified shuffle
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_validation_fraction() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            validation_fraction: default_validation_fraction(),
            seed: default_seed(),
        }
    }
}

/// Hyperparameters for both detectors
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectorsConfig {
    #[serde(default)]
    pub isolation_forest: IsolationForestConfig,
    #[serde(default)]
    pub autoencoder: AutoencoderConfig,
}

/// Isolation forest hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationForestConfig {
    /// Number of isolation trees
    pub n_trees: usize,
    /// Expected share of anomalies in the training data
    pub contamination: f64,
    /// Upper bound on the per-tree subsample
    pub max_samples: usize,
    /// Master seed; per-tree seeds are derived from it
    pub seed: u64,
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 200,
            contamination: 0.06,
            max_samples: 256,
            seed: 42,
        }
    }
}

/// Autoencoder hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoencoderConfig {
    /// Encoder widths; the decoder mirrors them
    pub hidden_dims: Vec<usize>,
    /// Passes over the training partition
    pub epochs: usize,
    /// Adam step size
    pub learning_rate: f64,
    /// Rows per optimizer step
    pub batch_size: usize,
    /// Seed for weight init and batch shuffling
    pub seed: u64,
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![16, 8],
            epochs: 8,
            learning_rate: 1e-3,
            batch_size: 256,
            seed: 42,
        }
    }
}

/// Serving pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Maximum transactions scored concurrently
    pub workers: usize,
    /// Seconds between metrics summaries
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

fn default_report_interval() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/config.toml")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Load from `path` when it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_path(path)
        } else {
            Ok(Self::default())
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                transaction_subject: "transactions".to_string(),
                score_subject: "fraud.scores".to_string(),
            },
            artifacts: ArtifactsConfig {
                dir: PathBuf::from("artifacts"),
            },
            training: TrainingConfig::default(),
            detectors: DetectorsConfig::default(),
            pipeline: PipelineConfig {
                workers: 4,
                report_interval_secs: default_report_interval(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.nats.url, "nats://localhost:4222");
        assert_eq!(config.detectors.isolation_forest.n_trees, 200);
        assert_eq!(config.detectors.isolation_forest.contamination, 0.06);
        assert_eq!(config.detectors.autoencoder.epochs, 8);
        assert_eq!(config.detectors.autoencoder.learning_rate, 1e-3);
        assert_eq!(config.training.validation_fraction, 0.2);
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[nats]
url = "nats://example:4222"
transaction_subject = "tx"
score_subject = "scores"

[artifacts]
dir = "out"

[pipeline]
workers = 2

[logging]
level = "debug"
format = "json"
"#
        )
        .unwrap();

        let config = AppConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.nats.transaction_subject, "tx");
        assert_eq!(config.artifacts.dir, PathBuf::from("out"));
        assert_eq!(config.pipeline.report_interval_secs, 30);
        assert_eq!(config.training.seed, 42);
        assert_eq!(
            config.detectors.isolation_forest,
            IsolationForestConfig::default()
        );
    }
}
