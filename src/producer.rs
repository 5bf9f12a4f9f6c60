//! NATS message producer for score reports

use crate::types::score::ScoreReport;
use anyhow::Result;
use async_nats::Client;
use tracing::debug;

/// Producer for publishing score reports to NATS
#[derive(Clone)]
pub struct ScoreProducer {
    client: Client,
    subject: String,
}

impl ScoreProducer {
    /// Create a new score producer
    pub fn new(client: Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
        }
    }

    /// Publish a score report
    pub async fn publish(&self, report: &ScoreReport) -> Result<()> {
        let payload = serde_json::to_vec(report)?;

        self.client
            .publish(self.subject.clone(), payload.into())
            .await?;

        debug!(
            report_id = %report.report_id,
            transaction_id = %report.transaction_id,
            flagged = report.flagged,
            "Published score report"
        );

        Ok(())
    }

    /// Get the subject name
    pub fn subject(&self) -> &str {
        &self.subject
    }
}
