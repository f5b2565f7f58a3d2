// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP transport backed by `reqwest`.
//!
//! Batches are posted as a urlencoded form: `data` holds the JSON array and
//! `token` the project token. Status handling:
//! - 2xx: accepted
//! - 5xx / 429: [`TransportError::ServiceUnavailable`], honoring `Retry-After` seconds
//! - other 4xx: the collector read the batch and refused it; the body is
//!   returned so the batch is acked rather than retried forever

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, warn};

use super::{Transport, TransportError};

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self { client })
    }

    /// Use a preconfigured client (custom TLS roots, proxies).
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn map_request_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Io(e.to_string())
    }
}

/// `Retry-After` in delta-seconds form; HTTP dates are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn is_unavailable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl Transport for HttpTransport {
    async fn is_online(&self, offline_mode: bool) -> bool {
        // Platform connectivity probes belong to the host; it toggles offline_mode.
        !offline_mode
    }

    async fn send(&self, url: &str, token: &str, payload: &str) -> Result<Vec<u8>, TransportError> {
        let parsed = Url::parse(url).map_err(|_| TransportError::MalformedUrl(url.to_string()))?;

        let response = self
            .client
            .post(parsed)
            .form(&[("data", payload), ("token", token)])
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if is_unavailable(status) {
            let retry_after = parse_retry_after(response.headers());
            debug!(%status, ?retry_after, "Collector unavailable");
            return Err(TransportError::ServiceUnavailable { retry_after });
        }

        let body = response.bytes().await.map_err(map_request_error)?;
        if !status.is_success() {
            warn!(%status, url, "Collector refused batch");
        }
        Ok(body.to_vec())
    }
}
