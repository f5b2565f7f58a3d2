// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test doubles for the integration suites.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use telemetry_dispatch::{
    DispatchConfig, Dispatcher, FeatureFlagCache, InMemoryStore, RecordStore, Transport,
    TransportError,
};

/// One batch the collector saw.
#[derive(Debug, Clone)]
pub struct SentBatch {
    pub url: String,
    pub token: String,
    pub records: Vec<Value>,
    pub at: Instant,
}

/// Collector double: replays scripted results in order, then accepts everything.
#[derive(Default)]
pub struct ScriptedTransport {
    offline: AtomicBool,
    script: Mutex<VecDeque<Result<Vec<u8>, TransportError>>>,
    sent: Mutex<Vec<SentBatch>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn then(&self, result: Result<Vec<u8>, TransportError>) -> &Self {
        self.script.lock().push_back(result);
        self
    }

    pub fn fail_times(&self, n: usize, error: TransportError) -> &Self {
        for _ in 0..n {
            self.then(Err(error.clone()));
        }
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<SentBatch> {
        self.sent.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.sent.lock().len()
    }

    /// Event names in the order they reached the collector, failed attempts included.
    pub fn event_names(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .flat_map(|b| b.records.iter())
            .filter_map(|r| r["event"].as_str().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn is_online(&self, offline_mode: bool) -> bool {
        !offline_mode && !self.offline.load(Ordering::SeqCst)
    }

    async fn send(&self, url: &str, token: &str, payload: &str) -> Result<Vec<u8>, TransportError> {
        let records: Vec<Value> = serde_json::from_str(payload).expect("batch payload is a JSON array");
        self.sent.lock().push(SentBatch {
            url: url.to_string(),
            token: token.to_string(),
            records,
            at: Instant::now(),
        });
        self.script.lock().pop_front().unwrap_or_else(|| Ok(b"1".to_vec()))
    }
}

pub struct Rig {
    pub dispatcher: Dispatcher,
    pub store: Arc<InMemoryStore>,
    pub transport: Arc<ScriptedTransport>,
    pub flags: Arc<FeatureFlagCache>,
}

pub fn rig(config: DispatchConfig) -> Rig {
    rig_with_store(config, InMemoryStore::new())
}

/// Route worker logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn rig_with_store(config: DispatchConfig, store: InMemoryStore) -> Rig {
    init_tracing();
    let store = Arc::new(store);
    let transport = ScriptedTransport::new();
    let flags = Arc::new(FeatureFlagCache::new());
    let dispatcher = Dispatcher::with_flags(
        config,
        store.clone() as Arc<dyn RecordStore>,
        transport.clone(),
        flags.clone(),
    )
    .expect("runtime available");
    Rig { dispatcher, store, transport, flags }
}

/// Config with automatic flushing off and the given bulk limit.
pub fn manual_config(bulk_upload_limit: usize) -> DispatchConfig {
    DispatchConfig {
        bulk_upload_limit,
        flush_interval_ms: -1,
        ..Default::default()
    }
}

/// Wait until the worker has processed `n` commands (or died).
pub async fn processed(dispatcher: &Dispatcher, n: u64) {
    let mut status = dispatcher.status_receiver();
    status
        .wait_for(|s| s.processed >= n || s.is_dead())
        .await
        .expect("worker status channel open");
}

/// Wait until the worker is dead.
pub async fn dead(dispatcher: &Dispatcher) {
    let mut status = dispatcher.status_receiver();
    status
        .wait_for(|s| s.is_dead())
        .await
        .expect("worker publishes its death");
}
