// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the dispatch engine.
//!
//! # Example
//!
//! ```
//! use telemetry_dispatch::DispatchConfig;
//!
//! // Minimal config (uses defaults)
//! let config = DispatchConfig::default();
//! assert_eq!(config.bulk_upload_limit, 40);
//! assert_eq!(
//!     config.events_endpoint("checkout"),
//!     "https://event.kcd.partners/api/publish/checkout"
//! );
//!
//! // Tuned config
//! let config = DispatchConfig {
//!     bulk_upload_limit: 10,
//!     flush_interval_ms: -1, // only explicit flushes
//!     ..Default::default()
//! };
//! assert!(config.flush_interval().is_none());
//! ```

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

/// Configuration for one dispatcher instance.
///
/// All fields have defaults matching the production SDK, so an empty
/// document deserializes to a usable config.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Queue depth that triggers an immediate flush
    #[serde(default = "default_bulk_upload_limit")]
    pub bulk_upload_limit: usize,

    /// Delay of the natural flush after new records; negative disables it
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: i64,

    /// Records older than this are purged when the store is opened
    #[serde(default = "default_data_expiration_ms")]
    pub data_expiration_ms: u64,

    /// Forwarded to the transport's connectivity probe
    #[serde(default)]
    pub offline_mode: bool,

    /// Collector base URL
    #[serde(default = "default_endpoint_base")]
    pub endpoint_base: String,

    /// Events path; the service name is appended
    #[serde(default = "default_events_path")]
    pub events_path: String,

    /// People endpoint (people records are only delivered when set)
    #[serde(default)]
    pub people_endpoint: Option<String>,

    /// Groups endpoint (group records are only delivered when set)
    #[serde(default)]
    pub groups_endpoint: Option<String>,

    /// Records per transmitted batch
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,

    /// Request timeout for the bundled HTTP transport
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    /// First retry delay after a failed send
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Upper bound of the exponential retry delay
    #[serde(default = "default_retry_ceiling_ms")]
    pub retry_ceiling_ms: u64,

    /// Extra default event properties (device metadata gathered by the host)
    #[serde(default)]
    pub default_properties: Map<String, Value>,
}

fn default_bulk_upload_limit() -> usize { 40 }
fn default_flush_interval_ms() -> i64 { 60_000 }
fn default_data_expiration_ms() -> u64 { 5 * 24 * 60 * 60 * 1000 } // 5 days
fn default_endpoint_base() -> String { "https://event.kcd.partners".into() }
fn default_events_path() -> String { "/api/publish/".into() }
fn default_max_batch_records() -> usize { 50 }
fn default_http_timeout_ms() -> u64 { 10_000 }
fn default_retry_base_ms() -> u64 { 60_000 }
fn default_retry_ceiling_ms() -> u64 { 10 * 60 * 1000 } // 10 minutes

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            bulk_upload_limit: default_bulk_upload_limit(),
            flush_interval_ms: default_flush_interval_ms(),
            data_expiration_ms: default_data_expiration_ms(),
            offline_mode: false,
            endpoint_base: default_endpoint_base(),
            events_path: default_events_path(),
            people_endpoint: None,
            groups_endpoint: None,
            max_batch_records: default_max_batch_records(),
            http_timeout_ms: default_http_timeout_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_ceiling_ms: default_retry_ceiling_ms(),
            default_properties: Map::new(),
        }
    }
}

impl DispatchConfig {
    /// Events endpoint for a service.
    #[must_use]
    pub fn events_endpoint(&self, service_name: &str) -> String {
        format!("{}{}{}", self.endpoint_base, self.events_path, service_name)
    }

    /// Natural flush delay, or `None` when automatic flushing is disabled.
    #[must_use]
    pub fn flush_interval(&self) -> Option<Duration> {
        u64::try_from(self.flush_interval_ms).ok().map(Duration::from_millis)
    }

    #[must_use]
    pub fn data_expiration(&self) -> Duration {
        Duration::from_millis(self.data_expiration_ms)
    }

    #[must_use]
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    #[must_use]
    pub fn retry_ceiling(&self) -> Duration {
        Duration::from_millis(self.retry_ceiling_ms)
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}
