// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch delivery for one project.
//!
//! ```text
//! pull_batch ──▶ send ──▶ Delivered   ──▶ delete_up_to, next batch
//!                     ├─▶ Discarded   ──▶ delete_up_to, next batch
//!                     └─▶ RetryNeeded ──▶ backoff, schedule retry flush, stop
//! ```
//!
//! A table is done when the store has nothing left to pull. A retry on any
//! table ends the flush; the remaining tables wait for the retry flush.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CommandProcessor, ProcessError};
use crate::command::FlushKey;
use crate::metrics;
use crate::storage::Table;
use crate::transport::SendOutcome;

/// How a table's send loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    Drained,
    RetryScheduled,
}

/// Running statistics over flush attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    count: u64,
    average_interval: Duration,
    last_flush: Option<Instant>,
}

impl FlushStats {
    /// Flush attempts so far, including offline ones.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean time between consecutive flush attempts.
    #[must_use]
    pub fn average_interval(&self) -> Duration {
        self.average_interval
    }

    pub fn record(&mut self, now: Instant) {
        let next_count = self.count + 1;
        if let Some(last) = self.last_flush {
            let interval = now.saturating_duration_since(last).as_millis();
            let total = interval + self.average_interval.as_millis() * u128::from(self.count);
            let average = total / u128::from(next_count);
            self.average_interval = Duration::from_millis(u64::try_from(average).unwrap_or(u64::MAX));
            metrics::set_flush_interval(self.average_interval);
        }
        self.last_flush = Some(now);
        self.count = next_count;
    }
}

impl CommandProcessor {
    /// Deliver everything queued for `key`.
    pub(super) async fn flush_project(&mut self, key: &FlushKey) -> Result<(), ProcessError> {
        self.flush_stats.record(Instant::now());

        if !self.transport.is_online(self.config.offline_mode).await {
            debug!(project = %key, "Not flushing data, offline");
            return Ok(());
        }

        for (table, url) in self.delivery_targets(key) {
            if self.send_table(key, table, &url).await? == LoopEnd::RetryScheduled {
                break;
            }
        }
        Ok(())
    }

    /// Tables with a configured endpoint, events first.
    fn delivery_targets(&self, key: &FlushKey) -> Vec<(Table, String)> {
        let mut targets = vec![(Table::Events, self.config.events_endpoint(&key.service_name))];
        if let Some(url) = &self.config.people_endpoint {
            targets.push((Table::People, url.clone()));
        }
        if let Some(url) = &self.config.groups_endpoint {
            targets.push((Table::Groups, url.clone()));
        }
        targets
    }

    async fn send_table(&mut self, key: &FlushKey, table: Table, url: &str) -> Result<LoopEnd, ProcessError> {
        let include_automatic = self.flags.get(&key.token).include_in_delivery();
        let FlushKey { token, service_name } = key;

        loop {
            let Some(batch) = self
                .store
                .pull_batch(table, token, service_name, include_automatic, self.config.max_batch_records)
                .await?
            else {
                return Ok(LoopEnd::Drained);
            };

            if batch.count == 0 {
                // Every row in the run was unreadable
                warn!(project = %key, table = %table, last_id = batch.last_id, "Dropping unreadable records");
                self.store
                    .delete_up_to(batch.last_id, table, token, service_name, include_automatic)
                    .await?;
                continue;
            }

            let outcome = match self.transport.send(url, token, &batch.payload).await {
                Ok(body) => {
                    debug!(
                        project = %key,
                        table = %table,
                        records = batch.count,
                        response = %String::from_utf8_lossy(&body),
                        "Successfully posted batch"
                    );
                    SendOutcome::Delivered
                }
                Err(e) => {
                    debug!(project = %key, table = %table, error = %e, "Batch send failed");
                    e.outcome()
                }
            };

            match outcome {
                SendOutcome::Delivered => {
                    metrics::record_batch(table.name(), "delivered", batch.count);
                    if self.retry.is_backing_off() {
                        info!(project = %key, failed_retries = self.retry.failed_retries(), "Delivery recovered, clearing backoff");
                        self.retry.reset();
                        self.scheduler.cancel(key);
                        metrics::set_retry_delay(Duration::ZERO);
                    }
                }
                SendOutcome::Discarded => {
                    metrics::record_batch(table.name(), "discarded", batch.count);
                    warn!(project = %key, table = %table, url, records = batch.count, "Cannot send batch, discarding");
                }
                SendOutcome::RetryNeeded { hint } => {
                    metrics::record_batch(table.name(), "retry", batch.count);
                    let (base, ceiling) = self.retry_bounds();
                    let delay = self.retry.register_failure(hint, base, ceiling);
                    self.scheduler.schedule(key.clone(), delay, false);
                    metrics::set_retry_delay(delay);
                    warn!(
                        project = %key,
                        table = %table,
                        failed_retries = self.retry.failed_retries(),
                        delay_ms = delay.as_millis() as u64,
                        "Retrying batch later"
                    );
                    return Ok(LoopEnd::RetryScheduled);
                }
            }

            self.store
                .delete_up_to(batch.last_id, table, token, service_name, include_automatic)
                .await?;
        }
    }
}
