// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public dispatch façade.
//!
//! Every call builds one [`Command`] and hands it to the worker's queue.
//! Calls never block and never fail: once the worker is dead, commands are
//! logged and dropped so telemetry problems cannot reach host control flow.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use serde_json::json;
//! use telemetry_dispatch::{DispatchConfig, Dispatcher, EventMessage, HttpTransport, InMemoryStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DispatchConfig::default();
//! let transport = HttpTransport::new(config.http_timeout())?;
//! let dispatcher = Dispatcher::new(config, Arc::new(InMemoryStore::new()), Arc::new(transport))?;
//!
//! dispatcher.submit_event(EventMessage::new("checkout", json!({"amount": 12}), "token", "shop"));
//! dispatcher.request_flush("token", "shop", false);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::command::{Command, EventMessage};
use crate::config::DispatchConfig;
use crate::flags::FeatureFlagCache;
use crate::metrics;
use crate::processor::CommandProcessor;
use crate::storage::{RecordStore, SqlStore, StoreError};
use crate::transport::{HttpTransport, Transport, TransportError};
use crate::worker::{Worker, WorkerStatus};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no tokio runtime available to run the dispatch worker")]
    NoRuntime,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Thread-safe handle to one dispatch worker.
pub struct Dispatcher {
    /// `None` once the worker is known to be gone
    sender: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    status: watch::Receiver<WorkerStatus>,
    flags: Arc<FeatureFlagCache>,
}

impl Dispatcher {
    /// Start a worker on the current tokio runtime.
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, DispatchError> {
        Self::with_flags(config, store, transport, Arc::new(FeatureFlagCache::new()))
    }

    /// Start a worker that reads feature flags from a shared cache.
    pub fn with_flags(
        config: DispatchConfig,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn Transport>,
        flags: Arc<FeatureFlagCache>,
    ) -> Result<Self, DispatchError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;

        let processor = CommandProcessor::new(config, store, transport, flags.clone());
        let (worker, sender, status) = Worker::new(processor);
        runtime.spawn(worker.run());
        debug!("Dispatch worker spawned");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            status,
            flags,
        })
    }

    /// Start a worker on the bundled SQLite store and HTTP transport.
    pub async fn open(config: DispatchConfig, database_url: &str) -> Result<Self, DispatchError> {
        let store = SqlStore::new(database_url).await?;
        let transport = HttpTransport::new(config.http_timeout())?;
        Self::new(config, Arc::new(store), Arc::new(transport))
    }

    pub fn submit_event(&self, event: EventMessage) {
        self.enqueue(Command::EnqueueEvent(event));
    }

    /// Queue a people update. Updates without `$distinct_id` are held as
    /// anonymous until [`submit_anonymous_people_push`](Self::submit_anonymous_people_push).
    pub fn submit_people(&self, payload: Value, token: impl Into<String>, service_name: impl Into<String>) {
        self.enqueue(Command::EnqueuePeople {
            payload,
            token: token.into(),
            service_name: service_name.into(),
        });
    }

    pub fn submit_group(&self, payload: Value, token: impl Into<String>, service_name: impl Into<String>) {
        self.enqueue(Command::EnqueueGroup {
            payload,
            token: token.into(),
            service_name: service_name.into(),
        });
    }

    /// Attach `distinct_id` to the project's anonymous people updates.
    pub fn submit_anonymous_people_push(
        &self,
        distinct_id: impl Into<String>,
        token: impl Into<String>,
        service_name: impl Into<String>,
    ) {
        self.enqueue(Command::PushAnonymousPeople {
            distinct_id: distinct_id.into(),
            token: token.into(),
            service_name: service_name.into(),
        });
    }

    pub fn clear_anonymous_updates(&self, token: impl Into<String>, service_name: impl Into<String>) {
        self.enqueue(Command::ClearAnonymousUpdates {
            token: token.into(),
            service_name: service_name.into(),
        });
    }

    pub fn request_flush(
        &self,
        token: impl Into<String>,
        service_name: impl Into<String>,
        check_feature_flags: bool,
    ) {
        self.enqueue(Command::Flush {
            token: token.into(),
            service_name: service_name.into(),
            check_feature_flags,
        });
    }

    pub fn install_feature_flag_check(&self, token: impl Into<String>) {
        self.enqueue(Command::InstallFeatureFlagCheck { token: token.into() });
    }

    /// Drop everything queued locally for the project.
    pub fn empty_queues(&self, token: impl Into<String>, service_name: impl Into<String>) {
        self.enqueue(Command::EmptyQueues {
            token: token.into(),
            service_name: service_name.into(),
        });
    }

    /// Merge `properties` into every queued, unsent event of the project.
    pub fn rewrite_event_properties(
        &self,
        token: impl Into<String>,
        service_name: impl Into<String>,
        properties: Map<String, Value>,
    ) {
        self.enqueue(Command::RewriteEventProperties {
            token: token.into(),
            service_name: service_name.into(),
            properties,
        });
    }

    /// Wipe the local store and stop the worker for good.
    pub fn kill(&self) {
        self.enqueue(Command::Kill);
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.sender.lock().is_none() || self.status.borrow().is_dead()
    }

    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        *self.status.borrow()
    }

    /// Watch worker progress and liveness.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<WorkerStatus> {
        self.status.clone()
    }

    /// Flag cache read by this dispatcher's worker.
    #[must_use]
    pub fn flags(&self) -> &Arc<FeatureFlagCache> {
        &self.flags
    }

    fn enqueue(&self, command: Command) {
        let kind = command.kind();
        let mut sender = self.sender.lock();

        let queued = match sender.as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        };
        if !queued {
            *sender = None;
            warn!(command = kind, "Dead dispatch worker, dropping command");
            metrics::record_dropped_dead(kind);
        }
    }
}
