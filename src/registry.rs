// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Host-owned map from application context to dispatcher.
//!
//! Construction is idempotent per key: the first caller builds the
//! dispatcher, everyone after gets the same handle. A dead dispatcher stays
//! registered until the host removes it.

use std::sync::Arc;

use dashmap::DashMap;

use crate::dispatcher::{DispatchError, Dispatcher};

#[derive(Default)]
pub struct DispatcherRegistry {
    dispatchers: DashMap<String, Arc<Dispatcher>>,
}

impl DispatcherRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher for `key`, built with `factory` on first use.
    ///
    /// `factory` runs at most once per key, even under concurrent callers.
    /// A failed factory leaves no entry behind.
    pub fn get_or_create<F>(&self, key: &str, factory: F) -> Result<Arc<Dispatcher>, DispatchError>
    where
        F: FnOnce() -> Result<Dispatcher, DispatchError>,
    {
        if let Some(existing) = self.dispatchers.get(key) {
            return Ok(existing.value().clone());
        }

        let entry = self
            .dispatchers
            .entry(key.to_string())
            .or_try_insert_with(|| factory().map(Arc::new))?;
        Ok(entry.value().clone())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<Dispatcher>> {
        self.dispatchers.get(key).map(|entry| entry.value().clone())
    }

    /// Forget the dispatcher for `key`. The worker exits once every handle is dropped.
    pub fn remove(&self, key: &str) -> Option<Arc<Dispatcher>> {
        self.dispatchers.remove(key).map(|(_, dispatcher)| dispatcher)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }
}
