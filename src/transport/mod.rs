// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport to the remote collector.
//!
//! The delivery loop only needs two things from the network: a connectivity
//! probe and a single POST whose failures are categorized. Every failure is
//! reduced to a [`SendOutcome`] so the loop never sees raw I/O errors.

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use http::HttpTransport;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("collector returned no response body")]
    EmptyResponse,
    #[error("service unavailable (retry after {retry_after:?})")]
    ServiceUnavailable { retry_after: Option<Duration> },
    #[error("cannot interpret '{0}' as a URL")]
    MalformedUrl(String),
}

/// What the delivery loop does with a batch after a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The collector answered; ack the batch.
    Delivered,
    /// The batch can never be sent as-is; drop it without touching backoff.
    Discarded,
    /// Keep the batch and try again later, no sooner than `hint` if given.
    RetryNeeded { hint: Option<Duration> },
}

impl TransportError {
    #[must_use]
    pub fn outcome(&self) -> SendOutcome {
        match self {
            Self::Timeout | Self::Io(_) | Self::EmptyResponse => SendOutcome::RetryNeeded { hint: None },
            Self::ServiceUnavailable { retry_after } => SendOutcome::RetryNeeded { hint: *retry_after },
            Self::MalformedUrl(_) => SendOutcome::Discarded,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether a send is worth attempting right now.
    async fn is_online(&self, offline_mode: bool) -> bool;

    /// POST one serialized batch. Any response body counts as accepted.
    async fn send(&self, url: &str, token: &str, payload: &str) -> Result<Vec<u8>, TransportError>;
}
