//! HTTP transport to the inference backend.
//!
//! The [`Transport`] trait is the seam under the retry and policy logic:
//! tests implement it with scripted responses, production uses
//! [`HttpTransport`] over reqwest.

use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use promptgate_core::UpstreamError;

use crate::wire::{ChatRequest, ChatResponse, TagsResponse};

/// Raw transport to the backend, one method per endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// `POST /api/chat` with `stream: false`.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, UpstreamError>;

    /// `POST /api/chat` with `stream: true`. Yields raw NDJSON lines;
    /// decoding is the caller's concern.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<mpsc::Receiver<Result<String, UpstreamError>>, UpstreamError>;

    /// `GET /api/tags`.
    async fn tags(&self) -> Result<TagsResponse, UpstreamError>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            probe_timeout,
        }
    }

    fn map_send_error(e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout(e.to_string())
        } else {
            UpstreamError::Network(e.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            warn!(status, body = %body, "Backend returned error status");
            return Err(UpstreamError::Status {
                status_code: status,
                message: body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, UpstreamError> {
        let url = format!("{}/api/chat", self.base_url);
        debug!(model = %req.model, "Sending chat request");

        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(req)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let response = Self::check_status(response).await?;
        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<mpsc::Receiver<Result<String, UpstreamError>>, UpstreamError> {
        let url = format!("{}/api/chat", self.base_url);
        debug!(model = %req.model, "Sending streaming chat request");

        let response = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let response = Self::check_status(response).await?;

        let (tx, rx) = mpsc::channel(64);

        // Read the byte stream and forward complete lines.
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(UpstreamError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(Ok(line)).await.is_err() {
                        return; // receiver dropped
                    }
                }
            }

            // Trailing bytes without a newline still form a line.
            let tail = buffer.trim();
            if !tail.is_empty() {
                let _ = tx.send(Ok(tail.to_string())).await;
            }
        });

        Ok(rx)
    }

    async fn tags(&self) -> Result<TagsResponse, UpstreamError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let response = Self::check_status(response).await?;
        response
            .json::<TagsResponse>()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))
    }
}
