//! HTTP relay transport.
//!
//! Speaks the `/relay/*` surface of a remote COMMANDER relay. Connection
//! failures, timeouts and 5xx answers are transient: the outbox keeps
//! retrying them with capped backoff and never spends retry budget on them.
//! Any other non-success status is a rejection, which counts against the
//! retry budget until the record is marked failed.

use async_trait::async_trait;
use commander_core::{BatchAck, DeliveryError, EnvelopeQuery, MessageEnvelope, RelayBatch};
use commander_storage::{PushOutcome, RelayPage, RelayTransport};
use reqwest::{Client, Response, StatusCode};

/// Relay client over HTTP.
///
/// Timeouts are applied by the sync engine around each call; the client only
/// bounds connection setup.
#[derive(Debug, Clone)]
pub struct HttpRelayTransport {
    client: Client,
    base_url: String,
}

impl HttpRelayTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| DeliveryError::Transient {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport_err(e: reqwest::Error) -> DeliveryError {
    DeliveryError::Transient {
        reason: e.to_string(),
    }
}

/// Map a non-success status to a delivery error.
async fn status_err(response: Response) -> DeliveryError {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    classify_status(status, message)
}

fn classify_status(status: StatusCode, message: String) -> DeliveryError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        DeliveryError::Transient {
            reason: format!("relay returned {status}: {message}"),
        }
    } else {
        DeliveryError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn push(&self, envelope: &MessageEnvelope) -> Result<PushOutcome, DeliveryError> {
        let response = self
            .client
            .post(self.url("/relay/immediate"))
            .json(envelope)
            .send()
            .await
            .map_err(transport_err)?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(PushOutcome::Stored),
            StatusCode::CONFLICT => Ok(PushOutcome::Duplicate),
            _ => Err(status_err(response).await),
        }
    }

    async fn push_batch(&self, batch: &RelayBatch) -> Result<BatchAck, DeliveryError> {
        let response = self
            .client
            .post(self.url("/relay/batch"))
            .json(batch)
            .send()
            .await
            .map_err(transport_err)?;

        if !response.status().is_success() {
            return Err(status_err(response).await);
        }
        response.json::<BatchAck>().await.map_err(transport_err)
    }

    async fn query(&self, query: &EnvelopeQuery) -> Result<RelayPage, DeliveryError> {
        let response = self
            .client
            .get(self.url("/relay/query"))
            .query(query)
            .send()
            .await
            .map_err(transport_err)?;

        if !response.status().is_success() {
            return Err(status_err(response).await);
        }
        response.json::<RelayPage>().await.map_err(transport_err)
    }

    async fn fetch(&self, content_hash: &str) -> Result<Option<MessageEnvelope>, DeliveryError> {
        let response = self
            .client
            .get(self.url(&format!("/relay/envelopes/{content_hash}")))
            .send()
            .await
            .map_err(transport_err)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => response
                .json::<MessageEnvelope>()
                .await
                .map(Some)
                .map_err(transport_err),
            _ => Err(status_err(response).await),
        }
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(transport_err)?;
        // A degraded relay still answers; only an unreachable one is down.
        if response.status().is_server_error() && response.status() != StatusCode::SERVICE_UNAVAILABLE {
            return Err(status_err(response).await);
        }
        Ok(())
    }
}
