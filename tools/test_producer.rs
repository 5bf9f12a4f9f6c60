//! Test Transaction Producer
//!
//! Generates and publishes synthetic transactions to NATS for pipeline testing.

use clap::Parser;
use fraud_anomaly_pipeline::{SyntheticGenerator, Transaction};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "test-producer")]
#[command(about = "Publish synthetic transactions to the scoring subject", long_about = None)]
struct Args {
    /// NATS server URL
    #[arg(long, default_value = "nats://localhost:4222")]
    nats_url: String,

    /// Subject to publish on
    #[arg(long, default_value = "transactions")]
    subject: String,

    /// Number of transactions
    #[arg(short, long, default_value = "100")]
    count: u64,

    /// Share of suspicious transactions
    #[arg(long, default_value = "0.1")]
    fraud_rate: f64,

    /// Share of transactions sent without device_score
    #[arg(long, default_value = "0.0")]
    missing_rate: f64,

    /// Delay between messages in milliseconds
    #[arg(long, default_value = "100")]
    delay_ms: u64,

    /// Generator seed
    #[arg(long, default_value = "7")]
    seed: u64,

    /// Print samples instead of publishing
    #[arg(long)]
    dry_run: bool,
}

/// Labeled transaction source built on the library's synthetic generator
struct TransactionSource {
    generator: SyntheticGenerator,
    rng: ChaCha8Rng,
    fraud_rate: f64,
    missing_rate: f64,
    transaction_counter: u64,
}

impl TransactionSource {
    fn new(args: &Args) -> anyhow::Result<Self> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&args.fraud_rate) && (0.0..=1.0).contains(&args.missing_rate),
            "fraud_rate and missing_rate must lie in [0, 1]"
        );
        Ok(Self {
            generator: SyntheticGenerator::new(args.seed)?,
            rng: ChaCha8Rng::seed_from_u64(args.seed.wrapping_add(1)),
            fraud_rate: args.fraud_rate,
            missing_rate: args.missing_rate,
            transaction_counter: 0,
        })
    }

    /// Next transaction and whether it was drawn as suspicious
    fn next(&mut self) -> (Transaction, bool) {
        self.transaction_counter += 1;
        let suspicious = self.rng.gen_bool(self.fraud_rate);
        let mut features = if suspicious {
            self.generator.sample_suspicious()
        } else {
            self.generator.sample_legitimate()
        };
        if self.rng.gen_bool(self.missing_rate) {
            features.device_score = None;
        }

        let transaction = Transaction::new(format!("tx_{:012}", self.transaction_counter), features);
        (transaction, suspicious)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_producer=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!(
        nats_url = %args.nats_url,
        subject = %args.subject,
        count = args.count,
        fraud_rate = args.fraud_rate,
        delay_ms = args.delay_ms,
        "Starting Test Transaction Producer"
    );

    let mut source = TransactionSource::new(&args)?;

    if args.dry_run {
        return run_dry_mode(&mut source, &args).await;
    }

    let client = match async_nats::connect(&args.nats_url).await {
        Ok(c) => {
            info!("Connected to NATS");
            c
        }
        Err(e) => {
            warn!(error = %e, "Failed to connect to NATS. Running in dry-run mode.");
            return run_dry_mode(&mut source, &args).await;
        }
    };

    let mut legitimate_count = 0;
    let mut suspicious_count = 0;

    for i in 0..args.count {
        let (transaction, suspicious) = source.next();
        if suspicious {
            suspicious_count += 1;
        } else {
            legitimate_count += 1;
        }

        let payload = serde_json::to_vec(&transaction)?;
        client.publish(args.subject.clone(), payload.into()).await?;

        if (i + 1) % 10 == 0 {
            info!(
                "Published {}/{} transactions ({} legitimate, {} suspicious)",
                i + 1,
                args.count,
                legitimate_count,
                suspicious_count
            );
        }

        tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
    }

    // Publishes are buffered by the client
    client.flush().await?;

    info!(
        "Completed! Published {} transactions ({} legitimate, {} suspicious)",
        args.count, legitimate_count, suspicious_count
    );

    Ok(())
}

async fn run_dry_mode(source: &mut TransactionSource, args: &Args) -> anyhow::Result<()> {
    info!("Running in dry-run mode (no NATS connection)");

    for i in 0..args.count {
        let (transaction, suspicious) = source.next();
        let json = serde_json::to_string_pretty(&transaction)?;

        if (i + 1) % 10 == 0 || i == 0 {
            info!(suspicious, "Sample transaction {}:\n{}", i + 1, json);
        }

        tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
    }

    Ok(())
}
