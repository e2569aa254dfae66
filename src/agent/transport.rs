use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};

use crate::model::{MetricRecord, MetricsPack};
use crate::retry::{Retrier, RetryPolicy};
use crate::signing::{self, SIGNATURE_HEADER};

/// Why a delivery did not land.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Connection refused, timeout, reset: worth retrying.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// 5xx from the collector: worth retrying.
    #[error("collector failed with {0}")]
    Server(StatusCode),

    /// 4xx from the collector: the payload itself is wrong. Not retried.
    #[error("collector rejected payload with {0}")]
    Rejected(StatusCode),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where sender workers hand records off to.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, record: &MetricRecord) -> Result<(), DeliveryError>;

    async fn deliver_batch(&self, pack: &MetricsPack) -> Result<(), DeliveryError>;
}

/// JSON-over-HTTP delivery to the collector, wrapped in a [`Retrier`].
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    key: Option<String>,
    retrier: Retrier,
}

impl HttpTransport {
    pub fn new(
        endpoint: impl Into<String>,
        key: Option<String>,
        policy: RetryPolicy,
    ) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            key: key.filter(|k| !k.is_empty()),
            retrier: Retrier::new(policy),
        })
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> Result<(), DeliveryError> {
        let url = format!("{}{}", self.endpoint, path);
        let signature = self.key.as_deref().map(|k| signing::sign(k, &body));

        let status = self
            .retrier
            .retry_async(|| {
                let mut req = self
                    .client
                    .post(&url)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body.clone());
                if let Some(sig) = &signature {
                    req = req.header(SIGNATURE_HEADER, sig.as_str());
                }
                async move {
                    let status = req.send().await?.status();
                    if status.is_server_error() {
                        return Err(DeliveryError::Server(status));
                    }
                    // 2xx and 4xx both end the retry loop.
                    Ok(status)
                }
            })
            .await?;

        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Rejected(status))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, record: &MetricRecord) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(record)?;
        self.post("/update/", body).await
    }

    async fn deliver_batch(&self, pack: &MetricsPack) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(pack)?;
        self.post("/updates/", body).await
    }
}
