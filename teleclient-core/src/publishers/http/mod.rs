use async_trait::async_trait;
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{BearerTokenProvider, INGESTION_AUTH_SCOPE};
use crate::config::HttpCfg;
use crate::error::{CoreResult, TelemetryError};
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::TelemetryItem;
use crate::publisher::{PublishReceipt, TelemetryPublisher};
use crate::tags::TelemetryTags;
use crate::wire::{Envelope, TrackResponse};

/// Path of the batch ingestion API, relative to the ingestion endpoint.
const TRACK_PATH: &str = "v2.1/track";

/// Publishes to one ingestion endpoint under one instrumentation key.
#[derive(Debug)]
pub struct HttpTelemetryPublisher {
    http: HttpClient,
    name: String,
    track_url: String,
    instrumentation_key: String,
    tags: TelemetryTags,
    token_provider: Option<BearerTokenProvider>,
    max_batch_items: usize,
}

impl HttpTelemetryPublisher {
    pub fn new(http: HttpClient, ingestion_endpoint: &Url, instrumentation_key: Uuid) -> Self {
        let base = ingestion_endpoint.as_str().trim_end_matches('/');
        Self {
            http,
            name: default_name(ingestion_endpoint, instrumentation_key),
            track_url: format!("{base}/{TRACK_PATH}"),
            instrumentation_key: instrumentation_key.to_string(),
            tags: TelemetryTags::new(),
            token_provider: None,
            max_batch_items: HttpCfg::default().max_batch_items,
        }
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str, instrumentation_key: Uuid) -> Self {
        let url = Url::parse(server_base).unwrap();
        HttpTelemetryPublisher::new(HttpClient::new_default().unwrap(), &url, instrumentation_key)
    }

    /// Authenticate every request with a token from `provider`.
    pub fn with_token_provider(mut self, provider: BearerTokenProvider) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Tags added to every envelope; item tags win on collision.
    pub fn with_tags(mut self, tags: TelemetryTags) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_max_batch_items(mut self, n: usize) -> Self {
        self.max_batch_items = n.max(1);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn requires_auth(&self) -> bool {
        self.token_provider.is_some()
    }

    async fn authorization(&self, cancel: &CancellationToken) -> CoreResult<Option<String>> {
        let Some(provider) = &self.token_provider else {
            return Ok(None);
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(self.cancelled()),
            token = provider.get_token(&[INGESTION_AUTH_SCOPE]) => {
                Ok(Some(token?.authorization_header()))
            }
        }
    }

    fn cancelled(&self) -> TelemetryError {
        TelemetryError::Cancelled {
            publisher: self.name.clone(),
        }
    }
}

/// `<ikey>@<host>[:port]`, so one key sent to two endpoints stays distinguishable.
fn default_name(endpoint: &Url, instrumentation_key: Uuid) -> String {
    match (endpoint.host_str(), endpoint.port()) {
        (Some(host), Some(port)) => format!("{instrumentation_key}@{host}:{port}"),
        (Some(host), None) => format!("{instrumentation_key}@{host}"),
        (None, _) => instrumentation_key.to_string(),
    }
}

#[async_trait]
impl TelemetryPublisher for HttpTelemetryPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(
        &self,
        items: &[TelemetryItem],
        cancel: &CancellationToken,
    ) -> CoreResult<PublishReceipt> {
        if items.is_empty() {
            return Ok(PublishReceipt::default());
        }

        let authorization = self.authorization(cancel).await?;
        let mut headers: Vec<(&str, &str)> = Vec::with_capacity(1);
        if let Some(value) = authorization.as_deref() {
            headers.push(("Authorization", value));
        }

        let envelopes: Vec<Envelope> = items
            .iter()
            .map(|item| Envelope::from_item(item, &self.instrumentation_key, &self.tags))
            .collect();

        let ctx = RequestCtx::for_publisher(&self.name);
        let mut receipt = PublishReceipt::default();
        for chunk in envelopes.chunks(self.max_batch_items) {
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            let sent = tokio::select! {
                _ = cancel.cancelled() => Err(self.cancelled()),
                resp = self.http.post_json::<_, TrackResponse>(&self.track_url, chunk, &headers, &ctx) => resp,
            };
            let resp = match sent {
                Ok(resp) => resp,
                Err(e) => {
                    if receipt.requests > 0 {
                        tracing::warn!(
                            publisher = %self.name,
                            delivered = receipt.items_sent,
                            remaining = items.len() - receipt.items_sent,
                            "batch partially delivered before failure"
                        );
                    }
                    return Err(e);
                }
            };

            let accepted = match &resp.body {
                Some(body) => {
                    for err in &body.errors {
                        tracing::debug!(
                            publisher = %self.name,
                            index = err.index,
                            status = err.status_code,
                            message = %err.message,
                            "item rejected by ingestion endpoint"
                        );
                    }
                    body.items_accepted.map_or(chunk.len(), |n| n as usize)
                }
                None => chunk.len(),
            };
            tracing::debug!(
                publisher = %self.name,
                items = chunk.len(),
                accepted,
                status = resp.status,
                latency_ms = resp.latency_ms,
                "ingestion request sent"
            );
            receipt.items_sent += chunk.len();
            receipt.items_accepted += accepted;
            receipt.requests += 1;
        }
        Ok(receipt)
    }
}
