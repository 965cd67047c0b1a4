//! reqwest-backed transport.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tracing::debug;

use super::wire::{ChatRequest, ChatResponse};
use super::{lines_from_chunks, EndpointConfig, LineStream, OcrTransport, TransportError};

/// How long the health probe waits for an answer.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection establishment budget. Streaming reads are bounded by the page
/// deadline instead of a client-wide timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to an OpenAI-compatible inference server over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
    endpoint: EndpointConfig,
    client: Client,
}

impl HttpTransport {
    pub fn new(endpoint: EndpointConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self { endpoint, client }
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status { status, body })
    }
}

#[async_trait]
impl OcrTransport for HttpTransport {
    async fn complete(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let url = self.endpoint.chat_completions_url();
        debug!("POST {} (non-streaming, timeout {:?})", url, timeout);

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let body: ChatResponse = response.json().await?;
        body.into_text()
            .ok_or_else(|| TransportError::Decode("response has no choices".to_string()))
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<LineStream, TransportError> {
        let url = self.endpoint.chat_completions_url();
        debug!("POST {} (streaming)", url);

        let response = self.client.post(&url).json(request).send().await?;
        let response = Self::check_status(response).await?;

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(TransportError::from))
            .boxed();

        Ok(lines_from_chunks(chunks))
    }

    async fn is_healthy(&self) -> bool {
        let url = self.endpoint.health_url();
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) => resp.status().as_u16() == 200,
            Err(e) => {
                debug!("Health probe to {} failed: {}", url, e);
                false
            }
        }
    }
}
