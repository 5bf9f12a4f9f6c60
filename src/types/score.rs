//! Scoring result data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two detectors of the ensemble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    IsolationForest,
    Autoencoder,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 2] = [DetectorKind::IsolationForest, DetectorKind::Autoencoder];

    /// Short prefix used in wire field names and threshold keys
    pub fn prefix(&self) -> &'static str {
        match self {
            DetectorKind::IsolationForest => "iso",
            DetectorKind::Autoencoder => "ae",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorKind::IsolationForest => write!(f, "isolation_forest"),
            DetectorKind::Autoencoder => write!(f, "autoencoder"),
        }
    }
}

/// What one detector produced for one row
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorOutcome {
    Scored(f64),
    Unavailable(String),
}

impl DetectorOutcome {
    pub fn score(&self) -> Option<f64> {
        match self {
            DetectorOutcome::Scored(score) => Some(*score),
            DetectorOutcome::Unavailable(_) => None,
        }
    }

    /// 1 iff a threshold is calibrated and the score reaches it
    pub fn flag(&self, threshold: Option<f64>) -> u8 {
        match (self.score(), threshold) {
            (Some(score), Some(threshold)) if score >= threshold => 1,
            _ => 0,
        }
    }
}

/// A detector that could not score a row, and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnavailableDetector {
    pub detector: DetectorKind,
    pub reason: String,
}

/// Combined decision payload for one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    /// Isolation forest score, `null` when the detector was unavailable
    pub iso_score: Option<f64>,
    /// Reconstruction error, `null` when the detector was unavailable
    pub ae_score: Option<f64>,
    pub iso_flag: u8,
    pub ae_flag: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<UnavailableDetector>,
}

impl ScoringResult {
    /// Package both outcomes against their (possibly absent) thresholds
    pub fn from_outcomes(
        iso: DetectorOutcome,
        iso_thr: Option<f64>,
        ae: DetectorOutcome,
        ae_thr: Option<f64>,
    ) -> Self {
        let mut unavailable = Vec::new();
        for (detector, outcome) in [
            (DetectorKind::IsolationForest, &iso),
            (DetectorKind::Autoencoder, &ae),
        ] {
            if let DetectorOutcome::Unavailable(reason) = outcome {
                unavailable.push(UnavailableDetector {
                    detector,
                    reason: reason.clone(),
                });
            }
        }

        Self {
            iso_score: iso.score(),
            ae_score: ae.score(),
            iso_flag: iso.flag(iso_thr),
            ae_flag: ae.flag(ae_thr),
            unavailable,
        }
    }

    /// Outcome of one detector, reconstructed from the record
    pub fn outcome(&self, detector: DetectorKind) -> DetectorOutcome {
        let score = match detector {
            DetectorKind::IsolationForest => self.iso_score,
            DetectorKind::Autoencoder => self.ae_score,
        };
        match score {
            Some(score) => DetectorOutcome::Scored(score),
            None => DetectorOutcome::Unavailable(
                self.unavailable
                    .iter()
                    .find(|u| u.detector == detector)
                    .map(|u| u.reason.clone())
                    .unwrap_or_else(|| "no score".to_string()),
            ),
        }
    }

    /// Either detector flagged the row
    pub fn any_flag(&self) -> bool {
        self.iso_flag == 1 || self.ae_flag == 1
    }
}

/// Envelope published for every scored transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreReport {
    /// Unique report identifier
    pub report_id: String,

    /// Associated transaction ID
    pub transaction_id: String,

    /// Detector scores and flags
    pub result: ScoringResult,

    /// Whether any detector flagged the transaction
    pub flagged: bool,

    /// Report generation timestamp
    pub scored_at: DateTime<Utc>,
}

impl ScoreReport {
    pub fn new(transaction_id: String, result: ScoringResult) -> Self {
        Self {
            report_id: uuid::Uuid::new_v4().to_string(),
            transaction_id,
            flagged: result.any_flag(),
            result,
            scored_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_requires_threshold() {
        let outcome = DetectorOutcome::Scored(10.0);
        assert_eq!(outcome.flag(None), 0);
        assert_eq!(outcome.flag(Some(10.0)), 1);
        assert_eq!(outcome.flag(Some(10.5)), 0);
        assert_eq!(DetectorOutcome::Unavailable("x".into()).flag(Some(-1.0)), 0);
    }

    #[test]
    fn test_result_wire_format() {
        let result = ScoringResult::from_outcomes(
            DetectorOutcome::Scored(0.12),
            Some(0.05),
            DetectorOutcome::Scored(0.4),
            None,
        );

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "iso_score": 0.12,
                "ae_score": 0.4,
                "iso_flag": 1,
                "ae_flag": 0
            })
        );
        assert!(result.any_flag());
    }

    #[test]
    fn test_unavailable_detector_surfaces_reason() {
        let result = ScoringResult::from_outcomes(
            DetectorOutcome::Unavailable("isolation forest artifact missing".into()),
            Some(0.0),
            DetectorOutcome::Scored(0.4),
            Some(1.0),
        );

        assert_eq!(result.iso_score, None);
        assert_eq!(result.iso_flag, 0);
        assert_eq!(
            result.outcome(DetectorKind::IsolationForest),
            DetectorOutcome::Unavailable("isolation forest artifact missing".into())
        );

        let json = serde_json::to_value(&result).unwrap();
        assert!(json["iso_score"].is_null());
        assert_eq!(json["unavailable"][0]["detector"], "isolation_forest");
    }

    #[test]
    fn test_score_report_flagged() {
        let result = ScoringResult::from_outcomes(
            DetectorOutcome::Scored(0.0),
            None,
            DetectorOutcome::Scored(3.0),
            Some(1.0),
        );
        let report = ScoreReport::new("tx_9".to_string(), result);
        assert!(report.flagged);
        assert_eq!(report.transaction_id, "tx_9");
    }
}
