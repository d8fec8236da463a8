use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UploadSummary {
    pub batch_id: Uuid,
    pub shop_id: Uuid,
    pub total_rows: usize,
    pub successful: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook answered {0}")]
    Rejected(u16),
}

/// Tells the seller an upload finished processing.
#[async_trait]
pub trait UploadNotifier: Send + Sync {
    async fn upload_processed(&self, summary: &UploadSummary) -> Result<(), NotifyError>;
}

pub fn build_client(timeout_secs: u64, connect_timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .build()
        .unwrap_or_else(|_| Client::new())
}

pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl UploadNotifier for WebhookNotifier {
    async fn upload_processed(&self, summary: &UploadSummary) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(summary).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl UploadNotifier for LogNotifier {
    async fn upload_processed(&self, summary: &UploadSummary) -> Result<(), NotifyError> {
        info!(
            target = "sokoni.upload",
            batch_id = %summary.batch_id,
            shop_id = %summary.shop_id,
            total = summary.total_rows,
            successful = summary.successful,
            skipped = summary.skipped,
            failed = summary.failed,
            "upload_processed"
        );
        Ok(())
    }
}

/// Fire-and-forget; a failed notification never fails the upload.
pub fn dispatch(notifier: Arc<dyn UploadNotifier>, summary: UploadSummary) {
    tokio::spawn(async move {
        if let Err(err) = notifier.upload_processed(&summary).await {
            warn!(
                target = "sokoni.upload",
                batch_id = %summary.batch_id,
                error = %err,
                "upload_notification_failed"
            );
        }
    });
}
