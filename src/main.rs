//! Fraud Anomaly Pipeline - Main Entry Point
//!
//! `train` fits and calibrates both detectors offline, `score` scores a single
//! row from the command line, `serve` consumes transactions from NATS and
//! publishes score reports, `generate` writes a synthetic dataset.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fraud_anomaly_pipeline::{
    config::{AppConfig, LoggingConfig},
    consumer::{parse_transaction, TransactionConsumer},
    dataset::SyntheticGenerator,
    metrics::{MetricsReporter, PipelineMetrics},
    models::ScoringEnsemble,
    producer::ScoreProducer,
    training::Trainer,
    DetectorKind, DetectorOutcome, FeatureVector, ScoreReport,
};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fraud-pipeline")]
#[command(about = "Unsupervised fraud scoring with an isolation forest and an autoencoder", long_about = None)]
struct Cli {
    /// Configuration file; defaults apply when it does not exist
    #[arg(short, long, global = true, default_value = "config/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train both detectors and write artifacts
    Train {
        /// Labeled CSV dataset
        #[arg(short, long)]
        data: PathBuf,

        /// Artifact directory (defaults to artifacts.dir)
        #[arg(short, long)]
        outdir: Option<PathBuf>,
    },
    /// Score one feature row given as JSON
    Score {
        /// Artifact directory (defaults to artifacts.dir)
        #[arg(short, long)]
        artifacts: Option<PathBuf>,

        /// Row such as '{"amount": 120, "hour": 3, "distance": 40}'
        #[arg(short, long)]
        json: String,
    },
    /// Score transactions from NATS and publish reports
    Serve {
        /// Artifact directory (defaults to artifacts.dir)
        #[arg(short, long)]
        artifacts: Option<PathBuf>,
    },
    /// Write a synthetic labeled dataset
    Generate {
        /// Number of rows
        #[arg(short, long, default_value = "5000")]
        rows: usize,

        /// Output CSV path
        #[arg(short, long)]
        out: PathBuf,

        /// Generator seed
        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Keep logistic-model rows until this share of them is fraud
        #[arg(long)]
        fraud_rate: Option<f64>,

        /// With --fraud-rate, plant clearly suspicious rows instead
        #[arg(long, requires = "fraud_rate")]
        planted: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)?;
    init_tracing(&config.logging)?;

    match cli.command {
        Commands::Train { data, outdir } => {
            let outdir = outdir.unwrap_or_else(|| config.artifacts.dir.clone());
            let trainer = Trainer::from_config(&config)?;
            let report = tokio::task::spawn_blocking(move || trainer.run(&data, &outdir))
                .await
                .context("Training task panicked")??;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Score { artifacts, json } => {
            let dir = artifacts.unwrap_or_else(|| config.artifacts.dir.clone());
            let ensemble = ScoringEnsemble::load(&dir)
                .with_context(|| format!("Failed to load artifacts from {}", dir.display()))?;
            let features: FeatureVector =
                serde_json::from_str(&json).context("Failed to parse feature row")?;
            features.validate()?;
            let result = ensemble.score(&features);
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Serve { artifacts } => {
            let dir = artifacts.unwrap_or_else(|| config.artifacts.dir.clone());
            serve(config, dir).await?;
        }
        Commands::Generate {
            rows,
            out,
            seed,
            fraud_rate,
            planted,
        } => {
            let mut generator = SyntheticGenerator::new(seed)?;
            let dataset = match fraud_rate {
                Some(rate) if planted => generator.generate_mixed(rows, rate),
                Some(rate) => generator.generate_at_rate(rows, rate),
                None => generator.generate(rows),
            };
            dataset.to_csv(&out)?;
            info!(
                rows,
                seed,
                positive_rate = ?dataset.positive_rate(),
                path = %out.display(),
                "Synthetic dataset written"
            );
        }
    }

    Ok(())
}

/// Install the global subscriber; `RUST_LOG` overrides the configured level
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!(
            "fraud_anomaly_pipeline={level},fraud_pipeline={level}",
            level = logging.level
        ))
        .context("Invalid logging.level")?,
    };

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn serve(config: AppConfig, artifacts_dir: PathBuf) -> Result<()> {
    info!("Starting Fraud Anomaly Pipeline");

    // Initialize metrics
    let metrics = Arc::new(PipelineMetrics::new());

    // Load the frozen ensemble once; every task shares it
    let ensemble = Arc::new(
        ScoringEnsemble::load(&artifacts_dir).with_context(|| {
            format!("Failed to load artifacts from {}", artifacts_dir.display())
        })?,
    );
    info!(
        iso_thr = ?ensemble.thresholds().iso_thr,
        ae_thr = ?ensemble.thresholds().ae_thr,
        "Scoring ensemble ready"
    );

    // Connect to NATS
    let client = async_nats::connect(&config.nats.url)
        .await
        .with_context(|| format!("Failed to connect to NATS at {}", config.nats.url))?;
    info!("Connected to NATS at {}", config.nats.url);

    // Initialize consumer and producer
    let consumer = TransactionConsumer::new(client.clone(), &config.nats.transaction_subject);
    let producer = Arc::new(ScoreProducer::new(client.clone(), &config.nats.score_subject));

    let num_workers = config.pipeline.workers.max(1);
    info!(
        workers = num_workers,
        listen = %consumer.subject(),
        publish = %producer.subject(),
        "Starting transaction processing loop"
    );

    // Semaphore to limit concurrent processing
    let semaphore = Arc::new(Semaphore::new(num_workers));
    let processed_count = Arc::new(AtomicU64::new(0));

    let reporter = MetricsReporter::new(metrics.clone(), config.pipeline.report_interval_secs);
    tokio::spawn(reporter.start());

    let mut subscription = consumer.subscribe().await?;

    while let Some(message) = subscription.next().await {
        // Acquire permit (limits concurrent tasks)
        let permit = semaphore.clone().acquire_owned().await?;

        let ensemble = ensemble.clone();
        let producer = producer.clone();
        let metrics = metrics.clone();
        let processed_count = processed_count.clone();

        tokio::spawn(async move {
            let start_time = Instant::now();

            match parse_transaction(&message.payload) {
                Ok(transaction) => {
                    let tx_id = transaction.transaction_id;
                    let features = transaction.features;

                    // Tree walks and matrix math stay off the async workers
                    let result = match tokio::task::spawn_blocking(move || {
                        ensemble.score(&features)
                    })
                    .await
                    {
                        Ok(result) => result,
                        Err(e) => {
                            metrics.record_rejected();
                            error!(transaction_id = %tx_id, error = %e, "Scoring task failed");
                            return;
                        }
                    };
                    let processing_time = start_time.elapsed();
                    metrics.record_result(&result, processing_time);

                    for detector in DetectorKind::ALL {
                        if let DetectorOutcome::Unavailable(reason) = result.outcome(detector) {
                            warn!(
                                transaction_id = %tx_id,
                                detector = %detector,
                                reason = %reason,
                                "Detector unavailable"
                            );
                        }
                    }

                    let report = ScoreReport::new(tx_id.clone(), result);
                    if report.flagged {
                        info!(
                            transaction_id = %tx_id,
                            iso_score = ?report.result.iso_score,
                            ae_score = ?report.result.ae_score,
                            iso_flag = report.result.iso_flag,
                            ae_flag = report.result.ae_flag,
                            processing_time_us = processing_time.as_micros(),
                            "Transaction flagged"
                        );
                    } else {
                        debug!(
                            transaction_id = %tx_id,
                            processing_time_us = processing_time.as_micros(),
                            "Transaction scored (not flagged)"
                        );
                    }

                    if let Err(e) = producer.publish(&report).await {
                        metrics.record_publish_failure();
                        error!(
                            transaction_id = %tx_id,
                            error = %e,
                            "Failed to publish score report"
                        );
                    }

                    let count = processed_count.fetch_add(1, Ordering::Relaxed) + 1;

                    // Log progress every 100 transactions
                    if count % 100 == 0 {
                        let processing_stats = metrics.get_processing_stats();
                        info!(
                            processed = count,
                            throughput = format!("{:.1} tx/s", metrics.get_throughput()),
                            avg_latency_us = processing_stats.mean_us,
                            "Processing milestone"
                        );
                    }
                }
                Err(e) => {
                    metrics.record_rejected();
                    warn!(error = %e, "Rejected transaction payload");
                }
            }

            // Release permit when done
            drop(permit);
        });
    }

    info!("Pipeline shutting down...");
    metrics.print_summary();

    Ok(())
}
