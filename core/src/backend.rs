//! Backend HTTP client: ingestion and health probe.

use std::time::Duration;

use async_trait::async_trait;
use pagetap_protocol::ingest::IngestRecord;
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::BackendConfig;
use crate::queue::{DeliveryError, DeliverySink};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("invalid backend url: {0}")]
    Url(String),
}

impl BackendError {
    /// Transport-level failures; the backend never answered.
    pub fn is_network(&self) -> bool {
        matches!(self, BackendError::Unreachable(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Unreachable(err.to_string())
    }
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn ingest(&self, record: &IngestRecord) -> Result<(), BackendError>;

    /// Succeeds when the backend answers its health endpoint with 2xx.
    async fn health(&self) -> Result<(), BackendError>;
}

pub struct HttpBackend {
    client: reqwest::Client,
    ingest_url: url::Url,
    health_url: url::Url,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let base = url::Url::parse(&config.base_url)
            .map_err(|e| BackendError::Url(format!("{}: {e}", config.base_url)))?;
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| BackendError::Url(format!("{path}: {e}")))
        };
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self {
            client,
            ingest_url: join(&config.ingest_path)?,
            health_url: join(&config.health_path)?,
        })
    }
}

async fn check(response: reqwest::Response) -> Result<(), BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status { status, body })
}

#[async_trait]
impl BackendClient for HttpBackend {
    async fn ingest(&self, record: &IngestRecord) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.ingest_url.clone())
            .json(record)
            .send()
            .await?;
        check(response).await
    }

    async fn health(&self) -> Result<(), BackendError> {
        let response = self.client.get(self.health_url.clone()).send().await?;
        check(response).await
    }
}

/// Adapts any [`BackendClient`] to the delivery queue.
pub struct BackendSink<'a>(pub &'a dyn BackendClient);

#[async_trait]
impl DeliverySink<IngestRecord> for BackendSink<'_> {
    async fn deliver(&self, item: &IngestRecord) -> Result<(), DeliveryError> {
        self.0
            .ingest(item)
            .await
            .map_err(|e| DeliveryError(e.to_string()))
    }
}
