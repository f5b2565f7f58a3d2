// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delivery backoff.
//!
//! Each retry-needed send doubles the wait, starting at the base delay and
//! capped at the ceiling. A larger server hint (`Retry-After`) wins over the
//! computed value:
//!
//! ```text
//! delay = max(min(base * 2^failed_retries, ceiling), server_hint)
//! ```
//!
//! # Example
//!
//! ```
//! use telemetry_dispatch::RetryState;
//! use std::time::Duration;
//!
//! let mut state = RetryState::default();
//! let base = Duration::from_secs(60);
//! let ceiling = Duration::from_secs(600);
//!
//! assert_eq!(state.register_failure(None, base, ceiling), Duration::from_secs(60));
//! assert_eq!(state.register_failure(None, base, ceiling), Duration::from_secs(120));
//! assert!(state.is_backing_off());
//!
//! state.reset();
//! assert!(!state.is_backing_off());
//! ```

use std::time::Duration;

/// Failure counters for one dispatch worker.
///
/// One instance is shared by every project the worker flushes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    failed_retries: u32,
    retry_after: Duration,
}

impl RetryState {
    /// Consecutive retry-needed outcomes since the last delivery.
    #[must_use]
    pub fn failed_retries(&self) -> u32 {
        self.failed_retries
    }

    /// Delay applied after the most recent failure.
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    #[must_use]
    pub fn is_backing_off(&self) -> bool {
        self.failed_retries > 0
    }

    /// Exponential component for the current failure count.
    #[must_use]
    pub fn exponential_delay(&self, base: Duration, ceiling: Duration) -> Duration {
        let factor = 1u32.checked_shl(self.failed_retries).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(ceiling)
    }

    /// Record a retry-needed outcome and return the delay before the next attempt.
    pub fn register_failure(
        &mut self,
        server_hint: Option<Duration>,
        base: Duration,
        ceiling: Duration,
    ) -> Duration {
        let delay = self
            .exponential_delay(base, ceiling)
            .max(server_hint.unwrap_or(Duration::ZERO));
        self.retry_after = delay;
        self.failed_retries = self.failed_retries.saturating_add(1);
        delay
    }

    /// Clear all backoff after a successful delivery.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
