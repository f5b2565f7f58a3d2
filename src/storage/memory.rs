// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::traits::{
    merge_properties, now_millis, AppendOutcome, RecordBatch, RecordStore, StoreError, Table,
    DISTINCT_ID_KEY,
};

#[derive(Debug, Clone)]
struct Row {
    id: i64,
    token: String,
    service_name: String,
    automatic: bool,
    created_at: i64,
    data: Value,
}

impl Row {
    fn belongs_to(&self, token: &str, service_name: &str) -> bool {
        self.token == token && self.service_name == service_name
    }
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    tables: HashMap<Table, Vec<Row>>,
}

impl Inner {
    fn rows(&mut self, table: Table) -> &mut Vec<Row> {
        self.tables.entry(table).or_default()
    }

    fn total_rows(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    fn project_count(&self, table: Table, token: &str, service_name: &str) -> usize {
        self.tables
            .get(&table)
            .map(|rows| rows.iter().filter(|r| r.belongs_to(token, service_name)).count())
            .unwrap_or(0)
    }

    fn push(&mut self, table: Table, token: &str, service_name: &str, automatic: bool, data: Value) {
        self.next_id += 1;
        let row = Row {
            id: self.next_id,
            token: token.to_string(),
            service_name: service_name.to_string(),
            automatic,
            created_at: now_millis(),
            data,
        };
        self.rows(table).push(row);
    }
}

/// In-process [`RecordStore`].
///
/// Row ids are global and strictly increasing, so batch order matches
/// append order. An optional row capacity makes `append` report
/// [`AppendOutcome::OutOfMemory`] once the store is full.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    capacity: Option<usize>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: None,
        }
    }

    /// Store that holds at most `capacity` rows across all tables.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: Some(capacity),
        }
    }

    /// Rows currently queued in `table` for the project.
    #[must_use]
    pub fn count(&self, table: Table, token: &str, service_name: &str) -> usize {
        self.inner.lock().project_count(table, token, service_name)
    }

    /// Rows across every table and project.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().total_rows()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the records queued in `table` for the project, oldest first.
    #[must_use]
    pub fn records(&self, table: Table, token: &str, service_name: &str) -> Vec<Value> {
        let inner = self.inner.lock();
        inner
            .tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.belongs_to(token, service_name))
                    .map(|r| r.data.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn append(
        &self,
        table: Table,
        record: &Value,
        token: &str,
        service_name: &str,
        automatic: bool,
    ) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(capacity) = self.capacity {
            if inner.total_rows() >= capacity {
                return Ok(AppendOutcome::OutOfMemory);
            }
        }
        inner.push(table, token, service_name, automatic, record.clone());
        Ok(AppendOutcome::Stored(inner.project_count(table, token, service_name)))
    }

    async fn pull_batch(
        &self,
        table: Table,
        token: &str,
        service_name: &str,
        include_automatic: bool,
        limit: usize,
    ) -> Result<Option<RecordBatch>, StoreError> {
        let inner = self.inner.lock();
        let Some(rows) = inner.tables.get(&table) else {
            return Ok(None);
        };

        let selected: Vec<&Row> = rows
            .iter()
            .filter(|r| r.belongs_to(token, service_name))
            .filter(|r| include_automatic || !r.automatic)
            .take(limit)
            .collect();

        let Some(last) = selected.last() else {
            return Ok(None);
        };

        let records: Vec<&Value> = selected.iter().map(|r| &r.data).collect();
        let payload = serde_json::to_string(&records)
            .map_err(|e| StoreError::Malformed(e.to_string()))?;

        Ok(Some(RecordBatch {
            last_id: last.id,
            payload,
            count: selected.len(),
        }))
    }

    async fn delete_up_to(
        &self,
        last_id: i64,
        table: Table,
        token: &str,
        service_name: &str,
        include_automatic: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.rows(table).retain(|r| {
            let acked = r.id <= last_id
                && r.belongs_to(token, service_name)
                && (include_automatic || !r.automatic);
            !acked
        });
        Ok(())
    }

    async fn purge_older_than(&self, cutoff_ms: i64, table: Table) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let rows = inner.rows(table);
        let before = rows.len();
        rows.retain(|r| r.created_at >= cutoff_ms);
        Ok((before - rows.len()) as u64)
    }

    async fn purge_all(
        &self,
        table: Table,
        token: &str,
        service_name: &str,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let rows = inner.rows(table);
        let before = rows.len();
        rows.retain(|r| !r.belongs_to(token, service_name));
        Ok((before - rows.len()) as u64)
    }

    async fn push_anonymous_to_people(
        &self,
        token: &str,
        service_name: &str,
        distinct_id: &str,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let anonymous = inner.rows(Table::AnonymousPeople);
        let (moving, staying): (Vec<Row>, Vec<Row>) = std::mem::take(anonymous)
            .into_iter()
            .partition(|r| r.belongs_to(token, service_name));
        *anonymous = staying;

        for row in moving {
            let mut data = row.data;
            match data.as_object_mut() {
                Some(object) => {
                    object.insert(DISTINCT_ID_KEY.to_string(), Value::String(distinct_id.to_string()));
                }
                None => continue,
            }
            inner.push(Table::People, token, service_name, false, data);
        }

        Ok(inner.project_count(Table::People, token, service_name))
    }

    async fn rewrite_properties(
        &self,
        table: Table,
        token: &str,
        service_name: &str,
        properties: &Map<String, Value>,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let rows = inner.rows(table);

        // All-or-nothing, like the SQL transaction
        let mut merged = Vec::new();
        for (index, row) in rows.iter().enumerate().filter(|(_, r)| r.belongs_to(token, service_name)) {
            let mut data = row.data.clone();
            merge_properties(&mut data, properties)?;
            merged.push((index, data));
        }

        let updated = merged.len();
        for (index, data) in merged {
            rows[index].data = data;
        }
        Ok(updated)
    }

    async fn wipe(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.tables.clear();
        Ok(())
    }
}
