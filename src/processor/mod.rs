// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Command processor.
//!
//! Interprets each [`Command`] against the record store and the feature
//! flag cache. Owned by the worker task, so nothing here needs locking.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized → Ready → Dead
//! ```
//!
//! The first command opens the store: records older than the configured
//! retention are purged before anything else runs. `Kill` (or a fault)
//! moves the processor to `Dead`, which is terminal.
//!
//! # Flush triggers
//!
//! After a command that queued records for a project:
//! - depth ≥ bulk upload limit and no backoff active, or the store ran out
//!   of space: flush the project now, inside the same step
//! - otherwise, if nothing is pending for the project: schedule a natural
//!   flush after the flush interval (never, if the interval is negative)

mod delivery;

pub use delivery::FlushStats;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{Command, EventMessage, FlushKey};
use crate::config::DispatchConfig;
use crate::event::{require_object, EventBuilder, PayloadError};
use crate::flags::FeatureFlagCache;
use crate::metrics;
use crate::resilience::backoff::RetryState;
use crate::storage::{AppendOutcome, RecordStore, StoreError, Table, DISTINCT_ID_KEY};
use crate::transport::Transport;
use crate::worker::scheduler::FlushScheduler;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl ProcessError {
    /// Malformed input drops one command; anything else is fatal to the worker.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Payload(_) | Self::Store(StoreError::Malformed(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Store not opened yet
    Uninitialized,
    Ready,
    /// Terminal; no command is processed again
    Dead,
}

/// What the worker loop does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop,
}

/// Queue signal produced by a command, feeding the flush trigger.
#[derive(Debug)]
enum QueueSignal {
    Nothing,
    Depth(FlushKey, usize),
    OutOfMemory(FlushKey),
    Killed,
}

impl QueueSignal {
    fn from_append(key: FlushKey, table: Table, outcome: AppendOutcome) -> Self {
        match outcome {
            AppendOutcome::Stored(depth) => {
                metrics::record_stored(table.name(), depth);
                Self::Depth(key, depth)
            }
            AppendOutcome::OutOfMemory => {
                metrics::record_out_of_memory(table.name());
                Self::OutOfMemory(key)
            }
        }
    }
}

pub struct CommandProcessor {
    config: DispatchConfig,
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn Transport>,
    flags: Arc<FeatureFlagCache>,
    builder: EventBuilder,
    state: ProcessorState,
    retry: RetryState,
    scheduler: FlushScheduler,
    flush_stats: FlushStats,
}

impl CommandProcessor {
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn Transport>,
        flags: Arc<FeatureFlagCache>,
    ) -> Self {
        let builder = EventBuilder::new(&config.default_properties);
        Self {
            config,
            store,
            transport,
            flags,
            builder,
            state: ProcessorState::Uninitialized,
            retry: RetryState::default(),
            scheduler: FlushScheduler::new(),
            flush_stats: FlushStats::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// Backoff shared by every project this processor flushes.
    #[must_use]
    pub fn retry_state(&self) -> RetryState {
        self.retry
    }

    #[must_use]
    pub fn scheduler(&self) -> &FlushScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn flush_stats(&self) -> FlushStats {
        self.flush_stats
    }

    /// Earliest pending delayed flush.
    #[must_use]
    pub fn next_flush_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    /// Take the earliest delayed flush due at `now`.
    pub fn pop_due_flush(&mut self, now: Instant) -> Option<Command> {
        self.scheduler.pop_due(now)
    }

    /// Process one command.
    ///
    /// Malformed input is logged and absorbed. Any other error leaves the
    /// processor `Dead` and is returned so the worker can stop.
    pub async fn process(&mut self, command: Command) -> Result<Step, ProcessError> {
        if self.state == ProcessorState::Dead {
            warn!(command = command.kind(), "Dead processor ignoring command");
            return Ok(Step::Stop);
        }

        let kind = command.kind();
        match self.process_inner(command).await {
            Ok(step) => Ok(step),
            Err(e) if e.is_malformed() => {
                warn!(command = kind, error = %e, "Dropping malformed command");
                metrics::record_malformed(kind);
                Ok(Step::Continue)
            }
            Err(e) => {
                self.state = ProcessorState::Dead;
                self.scheduler.clear();
                Err(e)
            }
        }
    }

    async fn process_inner(&mut self, command: Command) -> Result<Step, ProcessError> {
        if self.state == ProcessorState::Uninitialized {
            self.open().await?;
        }

        metrics::record_command(command.kind());
        let signal = self.apply(command).await?;
        if matches!(signal, QueueSignal::Killed) {
            return Ok(Step::Stop);
        }

        self.after_command(signal).await?;
        metrics::set_pending_flushes(self.scheduler.len());
        Ok(Step::Continue)
    }

    async fn open(&mut self) -> Result<(), ProcessError> {
        let retention = i64::try_from(self.config.data_expiration().as_millis()).unwrap_or(i64::MAX);
        let cutoff = crate::storage::traits::now_millis().saturating_sub(retention);
        for table in [Table::Events, Table::People] {
            let purged = self.store.purge_older_than(cutoff, table).await?;
            if purged > 0 {
                info!(table = %table, purged, "Purged expired records");
            }
        }
        self.state = ProcessorState::Ready;
        debug!("Record store opened");
        Ok(())
    }

    async fn apply(&mut self, command: Command) -> Result<QueueSignal, ProcessError> {
        match command {
            Command::EnqueueEvent(event) => self.enqueue_event(event).await,

            Command::EnqueuePeople { payload, token, service_name } => {
                let anonymous = !require_object(&payload)?.contains_key(DISTINCT_ID_KEY);
                let table = if anonymous { Table::AnonymousPeople } else { Table::People };
                debug!(token = %token, table = %table, "Queuing people record");

                let outcome = self.store.append(table, &payload, &token, &service_name, false).await?;
                if anonymous {
                    // Anonymous updates wait for an identity before they count toward a flush
                    return Ok(QueueSignal::Nothing);
                }
                Ok(QueueSignal::from_append(FlushKey::new(token, service_name), table, outcome))
            }

            Command::EnqueueGroup { payload, token, service_name } => {
                require_object(&payload)?;
                debug!(token = %token, "Queuing group record");
                let outcome = self.store.append(Table::Groups, &payload, &token, &service_name, false).await?;
                Ok(QueueSignal::from_append(FlushKey::new(token, service_name), Table::Groups, outcome))
            }

            Command::PushAnonymousPeople { distinct_id, token, service_name } => {
                let depth = self
                    .store
                    .push_anonymous_to_people(&token, &service_name, &distinct_id)
                    .await?;
                debug!(token = %token, depth, "Anonymous people updates identified");
                Ok(QueueSignal::Depth(FlushKey::new(token, service_name), depth))
            }

            Command::ClearAnonymousUpdates { token, service_name } => {
                let purged = self.store.purge_all(Table::AnonymousPeople, &token, &service_name).await?;
                debug!(token = %token, purged, "Anonymous people updates cleared");
                Ok(QueueSignal::Nothing)
            }

            Command::RewriteEventProperties { token, service_name, properties } => {
                let updated = self
                    .store
                    .rewrite_properties(Table::Events, &token, &service_name, &properties)
                    .await?;
                debug!(token = %token, updated, "Stored events updated with new properties");
                Ok(QueueSignal::Nothing)
            }

            Command::EmptyQueues { token, service_name } => {
                for table in Table::ALL {
                    self.store.purge_all(table, &token, &service_name).await?;
                }
                info!(token = %token, service = %service_name, "Emptied local queues");
                Ok(QueueSignal::Nothing)
            }

            Command::Flush { token, service_name, check_feature_flags } => {
                debug!(token = %token, service = %service_name, check_feature_flags, "Flushing queue due to scheduled or forced flush");
                self.flush_project(&FlushKey::new(token, service_name)).await?;
                Ok(QueueSignal::Nothing)
            }

            Command::InstallFeatureFlagCheck { token } => {
                debug!(token = %token, "Feature flag checks are refreshed out of band; ignoring install");
                Ok(QueueSignal::Nothing)
            }

            Command::Kill => {
                warn!("Worker received a hard kill, dumping all records");
                self.store.wipe().await?;
                self.scheduler.clear();
                self.state = ProcessorState::Dead;
                Ok(QueueSignal::Killed)
            }
        }
    }

    async fn enqueue_event(&mut self, event: EventMessage) -> Result<QueueSignal, ProcessError> {
        if event.is_automatic && !self.flags.get(&event.token).should_track() {
            debug!(event = %event.name, token = %event.token, "Automatic events disabled, dropping");
            metrics::record_automatic_skipped();
            return Ok(QueueSignal::Nothing);
        }

        let record = self.builder.build(&event)?;
        debug!(event = %event.name, token = %event.token, "Queuing event");

        let outcome = self
            .store
            .append(Table::Events, &record, &event.token, &event.service_name, event.is_automatic)
            .await?;
        Ok(QueueSignal::from_append(
            FlushKey::new(event.token, event.service_name),
            Table::Events,
            outcome,
        ))
    }

    async fn after_command(&mut self, signal: QueueSignal) -> Result<(), ProcessError> {
        let (key, depth, out_of_memory) = match signal {
            QueueSignal::Depth(key, depth) => (key, depth, false),
            QueueSignal::OutOfMemory(key) => (key, 0, true),
            QueueSignal::Nothing | QueueSignal::Killed => return Ok(()),
        };

        let over_limit = depth >= self.config.bulk_upload_limit && !self.retry.is_backing_off();
        if out_of_memory || over_limit {
            info!(project = %key, depth, out_of_memory, "Flushing queue due to bulk upload limit");
            return self.flush_project(&key).await;
        }

        if depth > 0 {
            if let Some(interval) = self.config.flush_interval() {
                if self.scheduler.schedule_if_absent(key.clone(), interval, true) {
                    debug!(project = %key, depth, interval_ms = interval.as_millis() as u64, "Scheduled flush");
                }
            }
        }
        Ok(())
    }

    fn retry_bounds(&self) -> (Duration, Duration) {
        (self.config.retry_base(), self.config.retry_ceiling())
    }
}

#[cfg(test)]
mod tests;
