// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cached remote feature flags.
//!
//! The only flag the dispatch core consults is whether automatic (SDK
//! captured) events are enabled for a project. The value is refreshed out of
//! band by whoever talks to the flag service; the worker only reads it.

use dashmap::DashMap;

/// Tri-state automatic-events flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutomaticEvents {
    Enabled,
    Disabled,
    #[default]
    Unknown,
}

impl AutomaticEvents {
    /// Whether an automatic event may be persisted.
    #[must_use]
    pub fn should_track(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Whether stored automatic events go out with a batch. Unknown is treated as off.
    #[must_use]
    pub fn include_in_delivery(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl From<Option<bool>> for AutomaticEvents {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => Self::Enabled,
            Some(false) => Self::Disabled,
            None => Self::Unknown,
        }
    }
}

/// Per-project flag cache, keyed by project token.
#[derive(Debug, Default)]
pub struct FeatureFlagCache {
    automatic_events: DashMap<String, AutomaticEvents>,
}

impl FeatureFlagCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached flag for a project; missing entries are `Unknown`.
    #[must_use]
    pub fn get(&self, token: &str) -> AutomaticEvents {
        self.automatic_events
            .get(token)
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }

    pub fn set(&self, token: impl Into<String>, value: AutomaticEvents) {
        self.automatic_events.insert(token.into(), value);
    }

    pub fn clear(&self, token: &str) {
        self.automatic_events.remove(token);
    }
}
