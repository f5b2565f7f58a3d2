// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed record log.
//!
//! One table per [`Table`], identical layout:
//! ```sql
//! CREATE TABLE events (
//!   id INTEGER PRIMARY KEY AUTOINCREMENT,  -- never reused, batches ack by max id
//!   data TEXT NOT NULL,                     -- record JSON
//!   created_at INTEGER NOT NULL,            -- unix millis, drives age purges
//!   token TEXT NOT NULL,
//!   service_name TEXT NOT NULL,
//!   automatic_data INTEGER NOT NULL DEFAULT 0
//! )
//! ```
//!
//! The pool is pinned to a single connection: only the dispatch worker uses
//! the store, and `sqlite::memory:` databases live exactly as long as their
//! connection.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, warn};

use super::traits::{
    merge_properties, now_millis, AppendOutcome, RecordBatch, RecordStore, StoreError, Table,
    DISTINCT_ID_KEY,
};
use crate::resilience::retry::{with_retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// SQLITE_FULL
const DISK_FULL_CODE: &str = "13";

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn is_disk_full(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(DISK_FULL_CODE),
        _ => false,
    }
}

fn automatic_filter(include_automatic: bool) -> &'static str {
    if include_automatic {
        ""
    } else {
        " AND automatic_data = 0"
    }
}

pub struct SqlStore {
    pool: AnyPool,
}

impl SqlStore {
    /// Open (or create) the store with store-open retry.
    ///
    /// `connection_string` is a sqlx SQLite URL such as
    /// `sqlite://telemetry.db?mode=rwc` or `sqlite::memory:`.
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        install_drivers();

        let pool = with_retry("sql_connect", RetryConfig::store_open(), || async {
            AnyPoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for table in Table::ALL {
            let create = format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    data TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    token TEXT NOT NULL,
                    service_name TEXT NOT NULL,
                    automatic_data INTEGER NOT NULL DEFAULT 0
                )",
                name = table.name()
            );
            let index = format!(
                "CREATE INDEX IF NOT EXISTS {name}_time_idx ON {name} (created_at)",
                name = table.name()
            );

            with_retry("sql_init_schema", RetryConfig::store_open(), || async {
                sqlx::query(&create).execute(&self.pool).await.map_err(backend)?;
                sqlx::query(&index).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    async fn project_count(
        &self,
        table: Table,
        token: &str,
        service_name: &str,
    ) -> Result<usize, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE token = ? AND service_name = ?",
            table.name()
        );
        let row = sqlx::query(&sql)
            .bind(token)
            .bind(service_name)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let n: i64 = row.try_get("n").map_err(backend)?;
        Ok(n as usize)
    }
}

#[async_trait]
impl RecordStore for SqlStore {
    async fn append(
        &self,
        table: Table,
        record: &Value,
        token: &str,
        service_name: &str,
        automatic: bool,
    ) -> Result<AppendOutcome, StoreError> {
        let data = serde_json::to_string(record).map_err(|e| StoreError::Malformed(e.to_string()))?;
        let sql = format!(
            "INSERT INTO {} (data, created_at, token, service_name, automatic_data) VALUES (?, ?, ?, ?, ?)",
            table.name()
        );

        let result = sqlx::query(&sql)
            .bind(data)
            .bind(now_millis())
            .bind(token)
            .bind(service_name)
            .bind(i64::from(automatic))
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {}
            Err(e) if is_disk_full(&e) => {
                warn!(table = %table, error = %e, "Record store is full");
                return Ok(AppendOutcome::OutOfMemory);
            }
            Err(e) => return Err(backend(e)),
        }

        let depth = self.project_count(table, token, service_name).await?;
        Ok(AppendOutcome::Stored(depth))
    }

    async fn pull_batch(
        &self,
        table: Table,
        token: &str,
        service_name: &str,
        include_automatic: bool,
        limit: usize,
    ) -> Result<Option<RecordBatch>, StoreError> {
        let sql = format!(
            "SELECT id, data FROM {} WHERE token = ? AND service_name = ?{} ORDER BY id ASC LIMIT ?",
            table.name(),
            automatic_filter(include_automatic)
        );
        let rows = sqlx::query(&sql)
            .bind(token)
            .bind(service_name)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut last_id = 0;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            last_id = row.try_get::<i64, _>("id").map_err(backend)?;
            let data: String = row.try_get("data").map_err(backend)?;
            match serde_json::from_str::<Value>(&data) {
                Ok(value) => records.push(value),
                // Still covered by last_id, so it is dropped with the batch
                Err(e) => warn!(table = %table, id = last_id, error = %e, "Skipping unreadable record"),
            }
        }

        let payload = serde_json::to_string(&records).map_err(|e| StoreError::Malformed(e.to_string()))?;
        Ok(Some(RecordBatch {
            last_id,
            payload,
            count: records.len(),
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
        let sql = format!(
            "DELETE FROM {} WHERE id <= ? AND token = ? AND service_name = ?{}",
            table.name(),
            automatic_filter(include_automatic)
        );
        let result = sqlx::query(&sql)
            .bind(last_id)
            .bind(token)
            .bind(service_name)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        debug!(table = %table, last_id, deleted = result.rows_affected(), "Acknowledged records deleted");
        Ok(())
    }

    async fn purge_older_than(&self, cutoff_ms: i64, table: Table) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {} WHERE created_at < ?", table.name());
        let result = sqlx::query(&sql)
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn purge_all(
        &self,
        table: Table,
        token: &str,
        service_name: &str,
    ) -> Result<u64, StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE token = ? AND service_name = ?",
            table.name()
        );
        let result = sqlx::query(&sql)
            .bind(token)
            .bind(service_name)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn push_anonymous_to_people(
        &self,
        token: &str,
        service_name: &str,
        distinct_id: &str,
    ) -> Result<usize, StoreError> {
        let select = format!(
            "SELECT id, data, created_at FROM {} WHERE token = ? AND service_name = ? ORDER BY id ASC",
            Table::AnonymousPeople.name()
        );
        let insert = format!(
            "INSERT INTO {} (data, created_at, token, service_name, automatic_data) VALUES (?, ?, ?, ?, 0)",
            Table::People.name()
        );
        let delete = format!("DELETE FROM {} WHERE id = ?", Table::AnonymousPeople.name());

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let rows = sqlx::query(&select)
            .bind(token)
            .bind(service_name)
            .fetch_all(&mut *tx)
            .await
            .map_err(backend)?;

        for row in &rows {
            let id: i64 = row.try_get("id").map_err(backend)?;
            let data: String = row.try_get("data").map_err(backend)?;
            let created_at: i64 = row.try_get("created_at").map_err(backend)?;

            sqlx::query(&delete).bind(id).execute(&mut *tx).await.map_err(backend)?;

            let mut record: Value = match serde_json::from_str(&data) {
                Ok(value) => value,
                Err(e) => {
                    warn!(id, error = %e, "Dropping unreadable anonymous people record");
                    continue;
                }
            };
            let Some(object) = record.as_object_mut() else {
                continue;
            };
            object.insert(DISTINCT_ID_KEY.to_string(), Value::String(distinct_id.to_string()));

            let updated = serde_json::to_string(&record).map_err(|e| StoreError::Malformed(e.to_string()))?;
            sqlx::query(&insert)
                .bind(updated)
                .bind(created_at)
                .bind(token)
                .bind(service_name)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;

        self.project_count(Table::People, token, service_name).await
    }

    async fn rewrite_properties(
        &self,
        table: Table,
        token: &str,
        service_name: &str,
        properties: &Map<String, Value>,
    ) -> Result<usize, StoreError> {
        let select = format!(
            "SELECT id, data FROM {} WHERE token = ? AND service_name = ?",
            table.name()
        );
        let update = format!("UPDATE {} SET data = ? WHERE id = ?", table.name());

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let rows = sqlx::query(&select)
            .bind(token)
            .bind(service_name)
            .fetch_all(&mut *tx)
            .await
            .map_err(backend)?;

        let mut updated = 0;
        for row in &rows {
            let id: i64 = row.try_get("id").map_err(backend)?;
            let data: String = row.try_get("data").map_err(backend)?;
            let mut record: Value = match serde_json::from_str(&data) {
                Ok(value) => value,
                Err(e) => {
                    warn!(id, error = %e, "Cannot rewrite unreadable record");
                    continue;
                }
            };
            merge_properties(&mut record, properties)?;

            let rewritten = serde_json::to_string(&record).map_err(|e| StoreError::Malformed(e.to_string()))?;
            sqlx::query(&update)
                .bind(rewritten)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            updated += 1;
        }
        tx.commit().await.map_err(backend)?;

        Ok(updated)
    }

    async fn wipe(&self) -> Result<(), StoreError> {
        for table in Table::ALL {
            let sql = format!("DELETE FROM {}", table.name());
            sqlx::query(&sql).execute(&self.pool).await.map_err(backend)?;
        }
        Ok(())
    }
}
