//! Transaction data structures for anomaly scoring

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The five model inputs of a transaction.
///
/// Every field is optional on the wire; a missing field is scored as 0.0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Transaction amount (>= 0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,

    /// Hour of day (0-23)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<f64>,

    /// Distance from the card holder's usual location (>= 0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,

    /// Device risk score (0-1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_score: Option<f64>,

    /// 1 when the card country differs from the merchant country
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_mismatch: Option<f64>,
}

impl FeatureVector {
    /// Create a fully populated feature vector
    pub fn new(
        amount: f64,
        hour: f64,
        distance: f64,
        device_score: f64,
        country_mismatch: f64,
    ) -> Self {
        Self {
            amount: Some(amount),
            hour: Some(hour),
            distance: Some(distance),
            device_score: Some(device_score),
            country_mismatch: Some(country_mismatch),
        }
    }

    /// Look up a field by its contract name
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "amount" => self.amount,
            "hour" => self.hour,
            "distance" => self.distance,
            "device_score" => self.device_score,
            "country_mismatch" => self.country_mismatch,
            _ => None,
        }
    }

    /// Check the documented ranges of every present field
    pub fn validate(&self) -> Result<()> {
        check("amount", self.amount, |v| v >= 0.0, "must be >= 0")?;
        check(
            "hour",
            self.hour,
            |v| (0.0..=23.0).contains(&v) && v.fract() == 0.0,
            "must be an integer in [0, 23]",
        )?;
        check("distance", self.distance, |v| v >= 0.0, "must be >= 0")?;
        check(
            "device_score",
            self.device_score,
            |v| (0.0..=1.0).contains(&v),
            "must be in [0, 1]",
        )?;
        check(
            "country_mismatch",
            self.country_mismatch,
            |v| v == 0.0 || v == 1.0,
            "must be 0 or 1",
        )
    }
}

fn check(
    name: &'static str,
    value: Option<f64>,
    valid: impl Fn(f64) -> bool,
    reason: &'static str,
) -> Result<()> {
    match value {
        Some(value) if !value.is_finite() || !valid(value) => Err(PipelineError::InvalidFeature {
            name,
            value,
            reason,
        }),
        _ => Ok(()),
    }
}

/// A transaction as it arrives on the serving subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Caller-supplied identifier, generated when absent
    #[serde(default = "generate_transaction_id")]
    pub transaction_id: String,

    /// Model inputs
    #[serde(flatten)]
    pub features: FeatureVector,

    /// Timestamp (optional, for real-time processing)
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

impl Transaction {
    /// Create a new transaction
    pub fn new(transaction_id: String, features: FeatureVector) -> Self {
        Self {
            transaction_id,
            features,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_flattened_fields() {
        let json = r#"{"transaction_id":"tx_1","amount":120.5,"hour":3,"distance":1.2}"#;
        let tx: Transaction = serde_json::from_str(json).unwrap();

        assert_eq!(tx.transaction_id, "tx_1");
        assert_eq!(tx.features.amount, Some(120.5));
        assert_eq!(tx.features.hour, Some(3.0));
        assert_eq!(tx.features.device_score, None);
        assert_eq!(tx.features.country_mismatch, None);
    }

    #[test]
    fn test_transaction_id_generated_when_absent() {
        let tx: Transaction = serde_json::from_str(r#"{"amount":1.0}"#).unwrap();
        assert!(tx.transaction_id.starts_with("tx_"));
    }

    #[test]
    fn test_validate_accepts_contract_ranges() {
        let features = FeatureVector::new(80.0, 23.0, 0.0, 1.0, 1.0);
        assert!(features.validate().is_ok());
        assert!(FeatureVector::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut features = FeatureVector::new(80.0, 12.0, 1.0, 0.5, 0.0);
        features.device_score = Some(1.5);
        let err = features.validate().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidFeature {
                name: "device_score",
                ..
            }
        ));

        features.device_score = Some(0.5);
        features.hour = Some(24.0);
        assert!(features.validate().is_err());

        features.hour = Some(4.0);
        features.amount = Some(-1.0);
        assert!(features.validate().is_err());
    }
}
