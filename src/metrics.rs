//! Performance metrics and statistics tracking for the scoring service.

use crate::types::score::{DetectorKind, ScoringResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector for the serving pipeline
pub struct PipelineMetrics {
    /// Transactions scored
    pub transactions_scored: AtomicU64,
    /// Transactions flagged by at least one detector
    pub transactions_flagged: AtomicU64,
    /// Payloads that failed to parse or validate
    pub transactions_rejected: AtomicU64,
    /// Score reports that could not be published
    pub publish_failures: AtomicU64,
    /// Flags raised per detector
    flags_by_detector: RwLock<HashMap<DetectorKind, u64>>,
    /// Unavailable outcomes per detector
    unavailable_by_detector: RwLock<HashMap<DetectorKind, u64>>,
    /// Processing times (in microseconds)
    processing_times: RwLock<Vec<u64>>,
    /// Rows where both detectors produced a flag decision
    flag_comparisons: AtomicU64,
    /// Rows where both detectors reached the same decision
    flag_agreements: AtomicU64,
    /// Start time for rate calculation
    start_time: Instant,
}

impl PipelineMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            transactions_scored: AtomicU64::new(0),
            transactions_flagged: AtomicU64::new(0),
            transactions_rejected: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            flags_by_detector: RwLock::new(HashMap::new()),
            unavailable_by_detector: RwLock::new(HashMap::new()),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            flag_comparisons: AtomicU64::new(0),
            flag_agreements: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a scored transaction
    pub fn record_result(&self, result: &ScoringResult, processing_time: Duration) {
        self.transactions_scored.fetch_add(1, Ordering::Relaxed);
        if result.any_flag() {
            self.transactions_flagged.fetch_add(1, Ordering::Relaxed);
        }

        if let Ok(mut times) = self.processing_times.write() {
            times.push(processing_time.as_micros() as u64);
            // Keep only last 10000 for memory efficiency
            if times.len() > 10000 {
                times.drain(0..5000);
            }
        }

        for (detector, flag) in [
            (DetectorKind::IsolationForest, result.iso_flag),
            (DetectorKind::Autoencoder, result.ae_flag),
        ] {
            if flag == 1 {
                if let Ok(mut flags) = self.flags_by_detector.write() {
                    *flags.entry(detector).or_insert(0) += 1;
                }
            }
        }

        if !result.unavailable.is_empty() {
            if let Ok(mut unavailable) = self.unavailable_by_detector.write() {
                for entry in &result.unavailable {
                    *unavailable.entry(entry.detector).or_insert(0) += 1;
                }
            }
        } else {
            self.flag_comparisons.fetch_add(1, Ordering::Relaxed);
            if result.iso_flag == result.ae_flag {
                self.flag_agreements.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record a payload that could not be scored
    pub fn record_rejected(&self) {
        self.transactions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a report that could not be published
    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get processing time statistics
    pub fn get_processing_stats(&self) -> ProcessingStats {
        let mut sorted = match self.processing_times.read() {
            Ok(times) if !times.is_empty() => times.clone(),
            _ => return ProcessingStats::default(),
        };
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len();

        ProcessingStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: sorted[count / 2],
            p95_us: sorted[(count as f64 * 0.95) as usize],
            p99_us: sorted[(count as f64 * 0.99) as usize],
            max_us: sorted[count - 1],
        }
    }

    /// Share of fully scored rows where both detectors agreed
    pub fn get_flag_agreement(&self) -> Option<f64> {
        let compared = self.flag_comparisons.load(Ordering::Relaxed);
        if compared == 0 {
            return None;
        }
        Some(self.flag_agreements.load(Ordering::Relaxed) as f64 / compared as f64)
    }

    /// Get current throughput (transactions per second)
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.transactions_scored.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Flags raised by one detector
    pub fn flags(&self, detector: DetectorKind) -> u64 {
        self.flags_by_detector
            .read()
            .ok()
            .and_then(|flags| flags.get(&detector).copied())
            .unwrap_or(0)
    }

    /// Unavailable outcomes of one detector
    pub fn unavailable(&self, detector: DetectorKind) -> u64 {
        self.unavailable_by_detector
            .read()
            .ok()
            .and_then(|counts| counts.get(&detector).copied())
            .unwrap_or(0)
    }

    /// Print summary statistics
    pub fn print_summary(&self) {
        let scored = self.transactions_scored.load(Ordering::Relaxed);
        let flagged = self.transactions_flagged.load(Ordering::Relaxed);
        let rejected = self.transactions_rejected.load(Ordering::Relaxed);
        let publish_failures = self.publish_failures.load(Ordering::Relaxed);
        let flag_rate = if scored > 0 {
            (flagged as f64 / scored as f64) * 100.0
        } else {
            0.0
        };

        let processing = self.get_processing_stats();
        let throughput = self.get_throughput();

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║          FRAUD ANOMALY PIPELINE - METRICS SUMMARY            ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Transactions Scored: {:>8}  │  Throughput: {:>6.1} tx/s    ║",
            scored, throughput
        );
        info!(
            "║ Flagged:             {:>8}  │  Flag Rate:  {:>6.1}%        ║",
            flagged, flag_rate
        );
        info!(
            "║ Rejected:            {:>8}  │  Publish Failures: {:>6}    ║",
            rejected, publish_failures
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Processing Time (μs): mean={:>5} p50={:>5} p95={:>5} p99={:>5} ║",
            processing.mean_us, processing.p50_us, processing.p95_us, processing.p99_us
        );
        match self.get_flag_agreement() {
            Some(agreement) => info!(
                "║ Detector Agreement: {:>5.1}% (same flag from both detectors) ║",
                agreement * 100.0
            ),
            None => info!("║ Detector Agreement: n/a                                      ║"),
        }
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Per Detector:                                                ║");
        for detector in DetectorKind::ALL {
            info!(
                "║   {:16}: flags={:>6} unavailable={:>6}              ║",
                detector.to_string(),
                self.flags(detector),
                self.unavailable(detector)
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Processing time statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Real-time metrics reporter that prints periodic summaries
pub struct MetricsReporter {
    metrics: Arc<PipelineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::score::DetectorOutcome;

    fn result(iso: f64, ae: Option<f64>) -> ScoringResult {
        let ae = match ae {
            Some(score) => DetectorOutcome::Scored(score),
            None => DetectorOutcome::Unavailable("autoencoder artifact not found".into()),
        };
        ScoringResult::from_outcomes(DetectorOutcome::Scored(iso), Some(0.0), ae, Some(1.0))
    }

    #[test]
    fn test_metrics_recording() {
        let metrics = PipelineMetrics::new();

        metrics.record_result(&result(0.1, Some(2.0)), Duration::from_micros(100));
        metrics.record_result(&result(-0.1, Some(0.5)), Duration::from_micros(200));
        metrics.record_rejected();

        assert_eq!(metrics.transactions_scored.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.transactions_flagged.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.transactions_rejected.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.flags(DetectorKind::IsolationForest), 1);
        assert_eq!(metrics.flags(DetectorKind::Autoencoder), 1);

        let stats = metrics.get_processing_stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.max_us, 200);
    }

    #[test]
    fn test_detector_agreement() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.get_flag_agreement(), None);

        metrics.record_result(&result(0.1, Some(2.0)), Duration::from_micros(10));
        metrics.record_result(&result(-0.1, Some(0.5)), Duration::from_micros(10));
        metrics.record_result(&result(0.1, Some(0.5)), Duration::from_micros(10));
        metrics.record_result(&result(-0.1, Some(2.0)), Duration::from_micros(10));

        assert_eq!(metrics.get_flag_agreement(), Some(0.5));
    }

    #[test]
    fn test_unavailable_outcomes_counted() {
        let metrics = PipelineMetrics::new();
        metrics.record_result(&result(0.1, None), Duration::from_micros(10));

        assert_eq!(metrics.unavailable(DetectorKind::Autoencoder), 1);
        assert_eq!(metrics.unavailable(DetectorKind::IsolationForest), 0);
        assert_eq!(metrics.get_flag_agreement(), None);
    }
}
