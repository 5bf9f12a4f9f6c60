//! Threshold calibration on labeled validation scores
//!
//! Candidate thresholds are quantiles of the validation scores. Each candidate
//! binarizes the scores and is ranked by average precision; the first best
//! candidate wins.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Linear-interpolated quantile of `values`, `q` in `[0, 1]`.
///
/// Returns NaN for an empty slice.
pub fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let (a, b) = (sorted[lo], sorted[hi]);
    // Clamp keeps the result monotone in q despite rounding
    (a + (pos - lo as f64) * (b - a)).clamp(a, b)
}

/// `n` evenly spaced values from `start` to `end` inclusive
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Step-wise average precision, `sum((R_n - R_{n-1}) * P_n)` over distinct
/// score thresholds in descending order. Zero when there are no positives.
pub fn average_precision(scores: &[f64], labels: &[u8]) -> f64 {
    let positives = labels.iter().filter(|&&l| l == 1).count();
    if positives == 0 {
        return 0.0;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut prev_recall = 0.0;
    let mut ap = 0.0;
    let mut i = 0;
    while i < order.len() {
        let threshold = scores[order[i]];
        while i < order.len() && scores[order[i]] == threshold {
            if labels[order[i]] == 1 {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        let precision = tp as f64 / (tp + fp) as f64;
        let recall = tp as f64 / positives as f64;
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
    }
    ap
}

/// ROC-AUC via the Mann-Whitney U statistic with tie-averaged ranks.
///
/// `None` when either class is missing.
pub fn roc_auc(scores: &[f64], labels: &[u8]) -> Option<f64> {
    let positives = labels.iter().filter(|&&l| l == 1).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j < order.len() && scores[order[j]] == scores[order[i]] {
            j += 1;
        }
        // 1-based ranks i+1..=j share their mean
        let rank = (i + 1 + j) as f64 / 2.0;
        positive_rank_sum += order[i..j].iter().filter(|&&k| labels[k] == 1).count() as f64 * rank;
        i = j;
    }

    let p = positives as f64;
    let u = positive_rank_sum - p * (p + 1.0) / 2.0;
    Some(u / (p * negatives as f64))
}

/// Chosen threshold and validation metrics for one detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub threshold: f64,
    /// Average precision of the binarized predictions at `threshold`
    pub metric: f64,
    pub roc_auc: Option<f64>,
    /// Average precision of the continuous scores
    pub average_precision: f64,
}

/// Grid search over score quantiles
#[derive(Debug, Clone, Copy)]
pub struct ThresholdCalibrator {
    candidates: usize,
    low: f64,
    high: f64,
}

impl Default for ThresholdCalibrator {
    fn default() -> Self {
        Self {
            candidates: 30,
            low: 0.5,
            high: 0.99,
        }
    }
}

impl ThresholdCalibrator {
    pub fn new(candidates: usize, low: f64, high: f64) -> Result<Self> {
        if candidates == 0 {
            return Err(PipelineError::invalid_parameter("candidates", "must be positive"));
        }
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low > high {
            return Err(PipelineError::invalid_parameter(
                "quantile_range",
                format!("[{}, {}] is not an ordered range inside [0, 1]", low, high),
            ));
        }
        Ok(Self {
            candidates,
            low,
            high,
        })
    }

    /// Candidate thresholds in ascending quantile order
    pub fn candidates(&self, scores: &[f64]) -> Vec<f64> {
        linspace(self.low, self.high, self.candidates)
            .into_iter()
            .map(|q| quantile(scores, q))
            .collect()
    }

    /// Pick the threshold maximizing binarized average precision.
    ///
    /// Returns `(threshold, metric)`; ties keep the lowest quantile.
    pub fn tune(&self, scores: &[f64], labels: &[u8]) -> Result<(f64, f64)> {
        validate(scores, labels)?;

        let mut best = (f64::NAN, -1.0);
        for threshold in self.candidates(scores) {
            let predictions: Vec<f64> = scores
                .iter()
                .map(|&s| if s >= threshold { 1.0 } else { 0.0 })
                .collect();
            let metric = average_precision(&predictions, labels);
            if metric > best.1 {
                best = (threshold, metric);
            }
        }

        debug!(threshold = best.0, metric = best.1, "Threshold tuned");
        Ok(best)
    }

    /// Tune the threshold and report ranking metrics of the raw scores
    pub fn calibrate(&self, scores: &[f64], labels: &[u8]) -> Result<Calibration> {
        let (threshold, metric) = self.tune(scores, labels)?;
        Ok(Calibration {
            threshold,
            metric,
            roc_auc: roc_auc(scores, labels),
            average_precision: average_precision(scores, labels),
        })
    }
}

fn validate(scores: &[f64], labels: &[u8]) -> Result<()> {
    if scores.is_empty() {
        return Err(PipelineError::invalid_parameter("scores", "no validation scores"));
    }
    if scores.len() != labels.len() {
        return Err(PipelineError::invalid_parameter(
            "labels",
            format!("{} labels for {} scores", labels.len(), scores.len()),
        ));
    }
    if let Some(bad) = scores.iter().find(|s| !s.is_finite()) {
        return Err(PipelineError::invalid_parameter(
            "scores",
            format!("non-finite score {}", bad),
        ));
    }
    if let Some(bad) = labels.iter().find(|&&l| l > 1) {
        return Err(PipelineError::invalid_parameter(
            "labels",
            format!("label {} is not 0 or 1", bad),
        ));
    }
    Ok(())
}
