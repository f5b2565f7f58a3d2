// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Telemetry Dispatch
//!
//! The dispatch-and-delivery core of a client telemetry SDK: records from
//! any number of caller threads are serialized onto one worker, persisted
//! locally, and posted to the collector in batches with exponential backoff.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Dispatcher (public façade)                │
//! │  • Non-blocking enqueue from any thread                     │
//! │  • Silently drops commands once the worker is dead          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     (unbounded mpsc, FIFO)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                            Worker                           │
//! │  • One tokio task per dispatcher                            │
//! │  • Delayed flushes, deduplicated per project                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Command Processor                      │
//! │  • Uninitialized → Ready → Dead                             │
//! │  • Store mutation, then flush trigger                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   (threshold / scheduled / forced)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Delivery Engine                       │
//! │  • pull → send → ack loop per table                         │
//! │  • Backoff: 60s doubling up to 10 min, server hint wins     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use telemetry_dispatch::{
//!     DispatchConfig, Dispatcher, DispatcherRegistry, EventMessage, HttpTransport, SqlStore,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = DispatcherRegistry::new();
//!     let config = DispatchConfig::default();
//!
//!     let store = SqlStore::new("sqlite://telemetry.db?mode=rwc").await.expect("Failed to open store");
//!     let transport = HttpTransport::new(config.http_timeout()).expect("Failed to build client");
//!
//!     let dispatcher = registry
//!         .get_or_create("main", || Dispatcher::new(config, Arc::new(store), Arc::new(transport)))
//!         .expect("Failed to start dispatcher");
//!
//!     dispatcher.submit_event(EventMessage::new("app_open", json!({"cold": true}), "token", "shop"));
//!     dispatcher.request_flush("token", "shop", false);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`dispatcher`]: The [`Dispatcher`] façade
//! - [`registry`]: Host-owned context → dispatcher map
//! - [`worker`]: Queue consumer and flush scheduler
//! - [`processor`]: Command state machine and delivery loop
//! - [`storage`]: Record store contract, in-memory and SQLite backends
//! - [`transport`]: Collector transport contract and HTTP implementation
//! - [`resilience`]: Delivery backoff and startup retry
//! - [`flags`]: Cached per-project feature flags

pub mod command;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod flags;
pub mod metrics;
pub mod processor;
pub mod registry;
pub mod resilience;
pub mod storage;
pub mod transport;
pub mod worker;

pub use command::{Command, EventMessage, FlushKey};
pub use config::DispatchConfig;
pub use dispatcher::{DispatchError, Dispatcher};
pub use event::{EventBuilder, PayloadError};
pub use flags::{AutomaticEvents, FeatureFlagCache};
pub use processor::{CommandProcessor, FlushStats, ProcessError, ProcessorState, Step};
pub use registry::DispatcherRegistry;
pub use resilience::backoff::RetryState;
pub use resilience::retry::RetryConfig;
pub use storage::{AppendOutcome, InMemoryStore, RecordBatch, RecordStore, SqlStore, StoreError, Table};
pub use transport::{HttpTransport, SendOutcome, Transport, TransportError};
pub use worker::{WorkerState, WorkerStatus};
