// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Commands consumed by the dispatch worker.
//!
//! Every public dispatcher call becomes exactly one [`Command`]. Commands are
//! plain owned values: once constructed they are moved into the queue and
//! never mutated.

use std::fmt;

use serde_json::{Map, Value};

/// Identity of a project's delivery stream.
///
/// At most one natural-delay flush is pending per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlushKey {
    pub token: String,
    pub service_name: String,
}

impl FlushKey {
    pub fn new(token: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            service_name: service_name.into(),
        }
    }
}

impl fmt::Display for FlushKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.token, self.service_name)
    }
}

/// A tracked event as submitted by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    pub name: String,
    /// Caller properties; must be a JSON object or null
    pub properties: Value,
    pub token: String,
    pub service_name: String,
    /// Captured by the SDK itself rather than host code
    pub is_automatic: bool,
    pub session_metadata: Map<String, Value>,
}

impl EventMessage {
    pub fn new(
        name: impl Into<String>,
        properties: Value,
        token: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            properties,
            token: token.into(),
            service_name: service_name.into(),
            is_automatic: false,
            session_metadata: Map::new(),
        }
    }

    /// Mark the event as automatically captured.
    #[must_use]
    pub fn automatic(mut self) -> Self {
        self.is_automatic = true;
        self
    }

    #[must_use]
    pub fn with_session_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.session_metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    EnqueueEvent(EventMessage),
    /// People update; anonymous when the payload has no `$distinct_id`
    EnqueuePeople {
        payload: Value,
        token: String,
        service_name: String,
    },
    EnqueueGroup {
        payload: Value,
        token: String,
        service_name: String,
    },
    PushAnonymousPeople {
        distinct_id: String,
        token: String,
        service_name: String,
    },
    ClearAnonymousUpdates {
        token: String,
        service_name: String,
    },
    Flush {
        token: String,
        service_name: String,
        check_feature_flags: bool,
    },
    /// Accepted for API compatibility; processing it has no effect
    InstallFeatureFlagCheck { token: String },
    EmptyQueues {
        token: String,
        service_name: String,
    },
    RewriteEventProperties {
        token: String,
        service_name: String,
        properties: Map<String, Value>,
    },
    Kill,
}

impl Command {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EnqueueEvent(_) => "enqueue_event",
            Self::EnqueuePeople { .. } => "enqueue_people",
            Self::EnqueueGroup { .. } => "enqueue_group",
            Self::PushAnonymousPeople { .. } => "push_anonymous_people",
            Self::ClearAnonymousUpdates { .. } => "clear_anonymous_updates",
            Self::Flush { .. } => "flush",
            Self::InstallFeatureFlagCheck { .. } => "install_feature_flag_check",
            Self::EmptyQueues { .. } => "empty_queues",
            Self::RewriteEventProperties { .. } => "rewrite_event_properties",
            Self::Kill => "kill",
        }
    }

    /// The project this command targets, if any.
    #[must_use]
    pub fn flush_key(&self) -> Option<FlushKey> {
        let (token, service_name) = match self {
            Self::EnqueueEvent(event) => (&event.token, &event.service_name),
            Self::EnqueuePeople { token, service_name, .. }
            | Self::EnqueueGroup { token, service_name, .. }
            | Self::PushAnonymousPeople { token, service_name, .. }
            | Self::ClearAnonymousUpdates { token, service_name }
            | Self::Flush { token, service_name, .. }
            | Self::EmptyQueues { token, service_name }
            | Self::RewriteEventProperties { token, service_name, .. } => (token, service_name),
            Self::InstallFeatureFlagCheck { .. } | Self::Kill => return None,
        };
        Some(FlushKey::new(token.clone(), service_name.clone()))
    }
}
