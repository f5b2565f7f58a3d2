// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry for opening the record store.
//!
//! A locked database file or a slow filesystem should get a few quick
//! retries, then surface as a [`StoreError`] from the constructor. Delivery
//! failures never come through here; they go to
//! [`RetryState`](super::backoff::RetryState) and the flush scheduler so the
//! worker never sleeps inside a command.
//!
//! ```
//! use std::time::Duration;
//! use telemetry_dispatch::RetryConfig;
//!
//! let open = RetryConfig::store_open();
//! assert_eq!(open.attempts, 5);
//! assert_eq!(open.delay_before(3), Duration::from_millis(400));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::storage::StoreError;

/// How hard to try before giving up on a store-open step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total tries, the first one included
    pub attempts: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::store_open()
    }
}

impl RetryConfig {
    /// Five tries, 200ms doubling up to 2s; gives up after about 3 seconds.
    #[must_use]
    pub fn store_open() -> Self {
        Self {
            attempts: 5,
            first_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }

    /// Pause before try number `attempt` (1-based, so try 1 waits on nothing).
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let doublings = (attempt - 2).min(16);
        self.first_delay.saturating_mul(1 << doublings).min(self.max_delay)
    }
}

/// Run one store-open `step`, retrying failures up to `config.attempts`.
pub(crate) async fn with_retry<F, Fut, T>(step: &str, config: RetryConfig, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        let error = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(step, attempt, "Store step recovered");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if attempt >= config.attempts {
            warn!(step, attempts = attempt, error = %error, "Giving up on store step");
            return Err(error);
        }

        attempt += 1;
        let delay = config.delay_before(attempt);
        warn!(step, attempt, error = %error, retry_in = ?delay, "Store step failed, retrying");
        sleep(delay).await;
    }
}
