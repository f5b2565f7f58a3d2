// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use super::*;
use crate::flags::AutomaticEvents;
use crate::storage::InMemoryStore;
use crate::transport::TransportError;

/// Transport that replays scripted results, then accepts everything.
#[derive(Default)]
struct ScriptedTransport {
    offline: AtomicBool,
    script: Mutex<VecDeque<Result<Vec<u8>, TransportError>>>,
    sent: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTransport {
    fn push(&self, result: Result<Vec<u8>, TransportError>) {
        self.script.lock().push_back(result);
    }

    fn sends(&self) -> usize {
        self.sent.lock().len()
    }

    fn batch(&self, index: usize) -> (String, Value) {
        self.sent.lock()[index].clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn is_online(&self, offline_mode: bool) -> bool {
        !offline_mode && !self.offline.load(Ordering::SeqCst)
    }

    async fn send(&self, url: &str, _token: &str, payload: &str) -> Result<Vec<u8>, TransportError> {
        let payload: Value = serde_json::from_str(payload).unwrap();
        self.sent.lock().push((url.to_string(), payload));
        self.script.lock().pop_front().unwrap_or_else(|| Ok(b"1".to_vec()))
    }
}

struct Harness {
    processor: CommandProcessor,
    store: Arc<InMemoryStore>,
    transport: Arc<ScriptedTransport>,
    flags: Arc<FeatureFlagCache>,
}

fn harness_with(config: DispatchConfig, store: InMemoryStore) -> Harness {
    let store = Arc::new(store);
    let transport = Arc::new(ScriptedTransport::default());
    let flags = Arc::new(FeatureFlagCache::new());
    let processor = CommandProcessor::new(config, store.clone(), transport.clone(), flags.clone());
    Harness { processor, store, transport, flags }
}

fn harness(bulk_upload_limit: usize) -> Harness {
    let config = DispatchConfig {
        bulk_upload_limit,
        ..Default::default()
    };
    harness_with(config, InMemoryStore::new())
}

fn event(name: &str, token: &str) -> Command {
    Command::EnqueueEvent(EventMessage::new(name, json!({"n": name}), token, "svc"))
}

fn flush(token: &str) -> Command {
    Command::Flush {
        token: token.into(),
        service_name: "svc".into(),
        check_feature_flags: false,
    }
}

fn key(token: &str) -> FlushKey {
    FlushKey::new(token, "svc")
}

#[tokio::test(start_paused = true)]
async fn test_first_command_opens_store() {
    let mut h = harness(10);
    assert_eq!(h.processor.state(), ProcessorState::Uninitialized);

    h.processor.process(event("a", "tok")).await.unwrap();
    assert_eq!(h.processor.state(), ProcessorState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_under_threshold_schedules_one_flush() {
    let mut h = harness(10);

    for i in 0..5 {
        let step = h.processor.process(event(&format!("e{i}"), "tok")).await.unwrap();
        assert_eq!(step, Step::Continue);
    }

    assert_eq!(h.transport.sends(), 0);
    assert_eq!(h.store.count(Table::Events, "tok", "svc"), 5);
    assert_eq!(h.processor.scheduler().len(), 1);
    assert_eq!(
        h.processor.scheduler().deadline(&key("tok")),
        Some(Instant::now() + Duration::from_secs(60))
    );
}

#[tokio::test(start_paused = true)]
async fn test_threshold_flushes_immediately() {
    let mut h = harness(10);

    for i in 0..10 {
        h.processor.process(event(&format!("e{i}"), "tok")).await.unwrap();
    }

    assert_eq!(h.transport.sends(), 1);
    let (url, batch) = h.transport.batch(0);
    assert_eq!(url, "https://event.kcd.partners/api/publish/svc");
    assert_eq!(batch.as_array().unwrap().len(), 10);
    assert_eq!(batch[0]["event"], "e0");
    assert_eq!(batch[9]["event"], "e9");
    assert_eq!(h.store.count(Table::Events, "tok", "svc"), 0);
    assert_eq!(h.processor.flush_stats().count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_negative_interval_never_schedules() {
    let config = DispatchConfig {
        bulk_upload_limit: 10,
        flush_interval_ms: -1,
        ..Default::default()
    };
    let mut h = harness_with(config, InMemoryStore::new());

    h.processor.process(event("a", "tok")).await.unwrap();
    assert!(h.processor.scheduler().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_batches_split_at_max_records() {
    let config = DispatchConfig {
        bulk_upload_limit: 100,
        max_batch_records: 3,
        ..Default::default()
    };
    let mut h = harness_with(config, InMemoryStore::new());

    for i in 0..7 {
        h.processor.process(event(&format!("e{i}"), "tok")).await.unwrap();
    }
    h.processor.process(flush("tok")).await.unwrap();

    assert_eq!(h.transport.sends(), 3);
    assert_eq!(h.transport.batch(2).1.as_array().unwrap().len(), 1);
    assert_eq!(h.store.count(Table::Events, "tok", "svc"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failure_mid_cycle_keeps_remaining_batches() {
    let config = DispatchConfig {
        bulk_upload_limit: 100,
        max_batch_records: 2,
        ..Default::default()
    };
    let mut h = harness_with(config, InMemoryStore::new());
    h.transport.push(Ok(b"1".to_vec()));
    h.transport.push(Err(TransportError::Timeout));

    for i in 0..6 {
        h.processor.process(event(&format!("e{i}"), "tok")).await.unwrap();
    }
    h.processor.process(flush("tok")).await.unwrap();

    // First batch acked, second failed, third never attempted
    assert_eq!(h.transport.sends(), 2);
    assert_eq!(h.store.count(Table::Events, "tok", "svc"), 4);
    assert_eq!(h.processor.retry_state().failed_retries(), 1);
    assert_eq!(
        h.processor.scheduler().deadline(&key("tok")),
        Some(Instant::now() + Duration::from_secs(60))
    );

    let remaining = h.store.records(Table::Events, "tok", "svc");
    assert_eq!(remaining[0]["event"], "e2");
    assert_eq!(remaining[3]["event"], "e5");
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_shared_across_projects() {
    let mut h = harness(1);
    h.transport.push(Err(TransportError::Timeout));

    h.processor.process(event("a", "t-a")).await.unwrap();
    assert!(h.processor.retry_state().is_backing_off());

    // Another project over the limit still waits out the shared backoff
    h.processor.process(event("b", "t-b")).await.unwrap();
    assert_eq!(h.transport.sends(), 1);
    assert_eq!(h.store.count(Table::Events, "t-b", "svc"), 1);
    assert!(h.processor.scheduler().contains(&key("t-b")));
    assert!(h.processor.scheduler().contains(&key("t-a")));
}

#[tokio::test(start_paused = true)]
async fn test_delivery_for_one_project_clears_shared_backoff() {
    let mut h = harness(1);
    h.transport.push(Err(TransportError::Timeout));

    h.processor.process(event("a", "t-a")).await.unwrap();
    h.processor.process(event("b", "t-b")).await.unwrap();
    let retry_deadline = h.processor.scheduler().deadline(&key("t-a"));

    h.processor.process(flush("t-b")).await.unwrap();

    assert!(!h.processor.retry_state().is_backing_off());
    assert_eq!(h.store.count(Table::Events, "t-b", "svc"), 0);
    assert!(!h.processor.scheduler().contains(&key("t-b")));
    // The failed project keeps its pending retry and its records
    assert_eq!(h.processor.scheduler().deadline(&key("t-a")), retry_deadline);
    assert!(retry_deadline.is_some());
    assert_eq!(h.store.count(Table::Events, "t-a", "svc"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_failures_double_delay() {
    let mut h = harness(1);
    h.transport.push(Err(TransportError::Io("reset".into())));
    h.transport.push(Err(TransportError::Timeout));

    // First failure: 60s
    h.processor.process(event("a", "tok")).await.unwrap();
    assert_eq!(h.processor.retry_state().failed_retries(), 1);
    assert_eq!(h.processor.retry_state().retry_after(), Duration::from_secs(60));

    // Over the limit but backing off: no send, retry flush stays as scheduled
    h.processor.process(event("b", "tok")).await.unwrap();
    assert_eq!(h.transport.sends(), 1);
    assert_eq!(
        h.processor.scheduler().deadline(&key("tok")),
        Some(Instant::now() + Duration::from_secs(60))
    );

    // Retry flush fails again: 120s
    h.processor.process(flush("tok")).await.unwrap();
    assert_eq!(h.processor.retry_state().failed_retries(), 2);
    assert_eq!(h.processor.retry_state().retry_after(), Duration::from_secs(120));
    assert_eq!(
        h.processor.scheduler().deadline(&key("tok")),
        Some(Instant::now() + Duration::from_secs(120))
    );
    assert_eq!(h.store.count(Table::Events, "tok", "svc"), 2);

    // Recovery clears backoff and the pending retry
    h.processor.process(flush("tok")).await.unwrap();
    assert!(!h.processor.retry_state().is_backing_off());
    assert!(!h.processor.scheduler().contains(&key("tok")));
    assert_eq!(h.store.count(Table::Events, "tok", "svc"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_wins() {
    let mut h = harness(1);
    h.transport.push(Err(TransportError::ServiceUnavailable {
        retry_after: Some(Duration::from_secs(300)),
    }));

    h.processor.process(event("a", "tok")).await.unwrap();
    assert_eq!(h.processor.retry_state().retry_after(), Duration::from_secs(300));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_url_discards_batch() {
    let mut h = harness(1);
    h.transport.push(Err(TransportError::MalformedUrl("bad".into())));

    h.processor.process(event("a", "tok")).await.unwrap();

    assert_eq!(h.store.count(Table::Events, "tok", "svc"), 0);
    assert!(!h.processor.retry_state().is_backing_off());
}

#[tokio::test(start_paused = true)]
async fn test_offline_flush_keeps_records_and_backoff() {
    let config = DispatchConfig {
        bulk_upload_limit: 1,
        offline_mode: true,
        ..Default::default()
    };
    let mut h = harness_with(config, InMemoryStore::new());

    h.processor.process(event("a", "tok")).await.unwrap();
    h.processor.process(flush("tok")).await.unwrap();

    assert_eq!(h.transport.sends(), 0);
    assert_eq!(h.store.count(Table::Events, "tok", "svc"), 1);
    assert_eq!(h.processor.retry_state(), RetryState::default());
    assert_eq!(h.processor.flush_stats().count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_memory_flushes_while_backing_off() {
    let mut h = harness_with(
        DispatchConfig { bulk_upload_limit: 50, ..Default::default() },
        InMemoryStore::with_capacity(2),
    );
    h.transport.push(Err(TransportError::Timeout));

    h.processor.process(event("a", "tok")).await.unwrap();
    h.processor.process(event("b", "tok")).await.unwrap();
    h.processor.process(flush("tok")).await.unwrap();
    assert!(h.processor.retry_state().is_backing_off());
    assert_eq!(h.transport.sends(), 1);

    // Store is full: the refused append still forces a flush
    h.processor.process(event("c", "tok")).await.unwrap();
    assert_eq!(h.transport.sends(), 2);
    assert_eq!(h.store.count(Table::Events, "tok", "svc"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_automatic_events_disabled_not_stored() {
    let mut h = harness(10);
    h.flags.set("tok", AutomaticEvents::Disabled);

    let auto = EventMessage::new("$ae_session", Value::Null, "tok", "svc").automatic();
    h.processor.process(Command::EnqueueEvent(auto)).await.unwrap();

    assert_eq!(h.store.count(Table::Events, "tok", "svc"), 0);
    assert!(h.processor.scheduler().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_automatic_events_delivered_only_when_enabled() {
    let mut h = harness(10);

    let auto = EventMessage::new("$ae_session", Value::Null, "tok", "svc").automatic();
    h.processor.process(Command::EnqueueEvent(auto)).await.unwrap();
    h.processor.process(event("manual", "tok")).await.unwrap();

    // Unknown flag: stored, but held back from delivery
    h.processor.process(flush("tok")).await.unwrap();
    assert_eq!(h.transport.sends(), 1);
    assert_eq!(h.transport.batch(0).1[0]["event"], "manual");
    assert_eq!(h.store.count(Table::Events, "tok", "svc"), 1);

    h.flags.set("tok", AutomaticEvents::Enabled);
    h.processor.process(flush("tok")).await.unwrap();
    assert_eq!(h.transport.sends(), 2);
    assert_eq!(h.transport.batch(1).1[0]["event"], "$ae_session");
    assert_eq!(h.store.count(Table::Events, "tok", "svc"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_empty_queues_is_scoped_to_project() {
    let mut h = harness(10);
    h.processor.process(event("a", "t1")).await.unwrap();
    h.processor.process(event("b", "t2")).await.unwrap();
    h.processor
        .process(Command::EnqueueGroup {
            payload: json!({"$group_key": "company"}),
            token: "t1".into(),
            service_name: "svc".into(),
        })
        .await
        .unwrap();

    h.processor
        .process(Command::EmptyQueues { token: "t1".into(), service_name: "svc".into() })
        .await
        .unwrap();

    assert_eq!(h.store.count(Table::Events, "t1", "svc"), 0);
    assert_eq!(h.store.count(Table::Groups, "t1", "svc"), 0);
    assert_eq!(h.store.count(Table::Events, "t2", "svc"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_anonymous_people_wait_for_identity() {
    let mut h = harness(10);
    let people = |payload: Value| Command::EnqueuePeople {
        payload,
        token: "tok".into(),
        service_name: "svc".into(),
    };

    h.processor.process(people(json!({"$set": {"plan": "pro"}}))).await.unwrap();
    assert_eq!(h.store.count(Table::AnonymousPeople, "tok", "svc"), 1);
    assert!(h.processor.scheduler().is_empty());

    h.processor
        .process(Command::PushAnonymousPeople {
            distinct_id: "user-7".into(),
            token: "tok".into(),
            service_name: "svc".into(),
        })
        .await
        .unwrap();

    let records = h.store.records(Table::People, "tok", "svc");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["$distinct_id"], "user-7");
    assert!(h.processor.scheduler().contains(&key("tok")));
}

#[tokio::test(start_paused = true)]
async fn test_people_delivered_when_endpoint_configured() {
    let config = DispatchConfig {
        bulk_upload_limit: 10,
        people_endpoint: Some("https://collector.test/engage".into()),
        ..Default::default()
    };
    let mut h = harness_with(config, InMemoryStore::new());

    h.processor
        .process(Command::EnqueuePeople {
            payload: json!({"$distinct_id": "u1", "$set": {"a": 1}}),
            token: "tok".into(),
            service_name: "svc".into(),
        })
        .await
        .unwrap();
    h.processor.process(flush("tok")).await.unwrap();

    assert_eq!(h.transport.sends(), 1);
    assert_eq!(h.transport.batch(0).0, "https://collector.test/engage");
    assert_eq!(h.store.count(Table::People, "tok", "svc"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_clear_anonymous_updates() {
    let mut h = harness(10);
    h.processor
        .process(Command::EnqueuePeople {
            payload: json!({"$set": {"a": 1}}),
            token: "tok".into(),
            service_name: "svc".into(),
        })
        .await
        .unwrap();

    h.processor
        .process(Command::ClearAnonymousUpdates { token: "tok".into(), service_name: "svc".into() })
        .await
        .unwrap();

    assert_eq!(h.store.count(Table::AnonymousPeople, "tok", "svc"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rewrite_event_properties() {
    let mut h = harness(10);
    h.processor.process(event("a", "tok")).await.unwrap();

    let mut properties = Map::new();
    properties.insert("$user_id".into(), json!("u1"));
    h.processor
        .process(Command::RewriteEventProperties {
            token: "tok".into(),
            service_name: "svc".into(),
            properties,
        })
        .await
        .unwrap();

    let records = h.store.records(Table::Events, "tok", "svc");
    assert_eq!(records[0]["prop"]["$user_id"], "u1");
    assert_eq!(records[0]["prop"]["n"], "a");
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_is_dropped() {
    let mut h = harness(10);
    let step = h
        .processor
        .process(Command::EnqueueGroup {
            payload: json!("not an object"),
            token: "tok".into(),
            service_name: "svc".into(),
        })
        .await
        .unwrap();

    assert_eq!(step, Step::Continue);
    assert_eq!(h.processor.state(), ProcessorState::Ready);
    assert!(h.store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_kill_wipes_and_stops() {
    let mut h = harness(10);
    h.processor.process(event("a", "tok")).await.unwrap();

    let step = h.processor.process(Command::Kill).await.unwrap();
    assert_eq!(step, Step::Stop);
    assert_eq!(h.processor.state(), ProcessorState::Dead);
    assert!(h.store.is_empty());
    assert!(h.processor.scheduler().is_empty());

    let step = h.processor.process(event("b", "tok")).await.unwrap();
    assert_eq!(step, Step::Stop);
    assert!(h.store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_feature_flag_install_is_inert() {
    let mut h = harness(10);
    let step = h
        .processor
        .process(Command::InstallFeatureFlagCheck { token: "tok".into() })
        .await
        .unwrap();

    assert_eq!(step, Step::Continue);
    assert!(h.store.is_empty());
    assert!(h.processor.scheduler().is_empty());
}
