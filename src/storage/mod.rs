// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local record store.
//!
//! - [`RecordStore`]: contract the dispatch worker relies on
//! - [`InMemoryStore`]: in-process store (tests, ephemeral hosts)
//! - [`SqlStore`]: durable SQLite store

pub mod traits;
pub mod memory;
pub mod sql;

pub use traits::{
    AppendOutcome, RecordBatch, RecordStore, StoreError, Table, DISTINCT_ID_KEY, PROPERTIES_KEY,
};
pub use memory::InMemoryStore;
pub use sql::SqlStore;
