//! Fraud Anomaly Pipeline Library
//!
//! Unsupervised transaction scoring with two detectors, an isolation forest
//! and a dense autoencoder, trained offline, calibrated against labeled
//! validation data and served read-only over NATS.

pub mod config;
pub mod consumer;
pub mod dataset;
pub mod error;
pub mod feature_extractor;
pub mod metrics;
pub mod models;
pub mod preprocess;
pub mod producer;
pub mod training;
pub mod types;

pub use config::AppConfig;
pub use consumer::TransactionConsumer;
pub use dataset::{Dataset, SyntheticGenerator};
pub use error::{PipelineError, Result};
pub use feature_extractor::FeatureExtractor;
pub use models::{ArtifactStore, ScoringEnsemble};
pub use producer::ScoreProducer;
pub use training::{Trainer, TrainingReport};
pub use types::{
    score::{DetectorKind, DetectorOutcome, ScoreReport, ScoringResult},
    transaction::{FeatureVector, Transaction},
};
