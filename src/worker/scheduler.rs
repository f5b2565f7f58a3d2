// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delayed flush scheduling.
//!
//! Holds at most one pending flush per [`FlushKey`]. The worker loop sleeps
//! until [`FlushScheduler::next_deadline`] and then turns due entries back
//! into [`Command::Flush`] commands.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::command::{Command, FlushKey};

#[derive(Debug, Clone, Copy)]
struct PendingFlush {
    due: Instant,
    check_feature_flags: bool,
}

#[derive(Debug, Default)]
pub struct FlushScheduler {
    pending: HashMap<FlushKey, PendingFlush>,
}

impl FlushScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a flush, replacing any pending one for the same key.
    pub fn schedule(&mut self, key: FlushKey, delay: Duration, check_feature_flags: bool) {
        let due = Instant::now() + delay;
        self.pending.insert(key, PendingFlush { due, check_feature_flags });
    }

    /// Schedule a flush unless one is already pending for the key.
    /// Returns whether a new entry was added.
    pub fn schedule_if_absent(&mut self, key: FlushKey, delay: Duration, check_feature_flags: bool) -> bool {
        if self.pending.contains_key(&key) {
            return false;
        }
        self.schedule(key, delay, check_feature_flags);
        true
    }

    pub fn cancel(&mut self, key: &FlushKey) -> bool {
        self.pending.remove(key).is_some()
    }

    #[must_use]
    pub fn contains(&self, key: &FlushKey) -> bool {
        self.pending.contains_key(key)
    }

    /// When the pending flush for `key` fires.
    #[must_use]
    pub fn deadline(&self, key: &FlushKey) -> Option<Instant> {
        self.pending.get(key).map(|p| p.due)
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.due).min()
    }

    /// Remove and return the earliest flush due at `now`, if any.
    pub fn pop_due(&mut self, now: Instant) -> Option<Command> {
        let key = self
            .pending
            .iter()
            .filter(|(_, p)| p.due <= now)
            .min_by_key(|(_, p)| p.due)
            .map(|(key, _)| key.clone())?;
        let pending = self.pending.remove(&key)?;

        Some(Command::Flush {
            token: key.token,
            service_name: key.service_name,
            check_feature_flags: pending.check_feature_flags,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
