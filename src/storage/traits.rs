// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Malformed record: {0}")]
    Malformed(String),
    #[error("Store is closed")]
    Closed,
}

/// Logical tables of the local record log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Events,
    People,
    AnonymousPeople,
    Groups,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Events,
        Table::People,
        Table::AnonymousPeople,
        Table::Groups,
    ];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::People => "people",
            Self::AnonymousPeople => "anonymous_people",
            Self::Groups => "groups",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Record stored; carries the table's row count for the project.
    Stored(usize),
    /// The store refused the record because it ran out of space.
    OutOfMemory,
}

/// A contiguous run of pending records, identified by the id of its last row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub last_id: i64,
    /// JSON array of the records, ready to post.
    pub payload: String,
    pub count: usize,
}

/// Durable append-only record log, one log per [`Table`], partitioned by
/// project token and service name.
///
/// Only the dispatch worker touches the store, so implementations need no
/// cross-call transactional guarantees beyond each call being atomic.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn append(
        &self,
        table: Table,
        record: &Value,
        token: &str,
        service_name: &str,
        automatic: bool,
    ) -> Result<AppendOutcome, StoreError>;

    /// Pull the oldest pending records, or `None` when nothing is queued.
    /// Automatic records are skipped unless `include_automatic` is set.
    async fn pull_batch(
        &self,
        table: Table,
        token: &str,
        service_name: &str,
        include_automatic: bool,
        limit: usize,
    ) -> Result<Option<RecordBatch>, StoreError>;

    /// Delete acknowledged records with `id <= last_id`, using the same
    /// automatic-record filter the batch was pulled with.
    async fn delete_up_to(
        &self,
        last_id: i64,
        table: Table,
        token: &str,
        service_name: &str,
        include_automatic: bool,
    ) -> Result<(), StoreError>;

    /// Delete every record created before `cutoff_ms` (unix millis).
    async fn purge_older_than(&self, cutoff_ms: i64, table: Table) -> Result<u64, StoreError>;

    async fn purge_all(
        &self,
        table: Table,
        token: &str,
        service_name: &str,
    ) -> Result<u64, StoreError>;

    /// Stamp `distinct_id` onto the project's anonymous people records and
    /// move them to the people table. Returns the people row count.
    async fn push_anonymous_to_people(
        &self,
        token: &str,
        service_name: &str,
        distinct_id: &str,
    ) -> Result<usize, StoreError>;

    /// Merge `properties` into the `prop` object of every queued record.
    /// Returns how many records were rewritten.
    async fn rewrite_properties(
        &self,
        table: Table,
        token: &str,
        service_name: &str,
        properties: &Map<String, Value>,
    ) -> Result<usize, StoreError>;

    async fn wipe(&self) -> Result<(), StoreError>;
}

/// Key under which people records carry their identity.
pub const DISTINCT_ID_KEY: &str = "$distinct_id";

/// Key of the property object inside an event record.
pub const PROPERTIES_KEY: &str = "prop";

/// Shared rewrite used by every backend: merge `properties` into the
/// record's property object, creating it if absent.
pub(crate) fn merge_properties(
    record: &mut Value,
    properties: &Map<String, Value>,
) -> Result<(), StoreError> {
    let Some(object) = record.as_object_mut() else {
        return Err(StoreError::Malformed("stored record is not a JSON object".into()));
    };
    let target = object
        .entry(PROPERTIES_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(target) = target.as_object_mut() else {
        return Err(StoreError::Malformed(format!("'{}' is not a JSON object", PROPERTIES_KEY)));
    };
    for (key, value) in properties {
        target.insert(key.clone(), value.clone());
    }
    Ok(())
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
