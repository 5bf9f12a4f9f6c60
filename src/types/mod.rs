//! Type definitions for the fraud anomaly pipeline

pub mod score;
pub mod transaction;

pub use score::{DetectorKind, DetectorOutcome, ScoreReport, ScoringResult};
pub use transaction::{FeatureVector, Transaction};
