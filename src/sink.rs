// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sink store integration traits.
//!
//! Defines what the replicator needs from the downstream analytical store:
//! existence checks on the natural key and on the identity, and a single-row
//! insert. Records are never updated or deleted.
//!
//! # Example
//!
//! ```rust,no_run
//! use audit_replicator::sink::{InsertOutcome, SinkResult, SinkStore};
//! use audit_replicator::source::BoxFuture;
//! use audit_replicator::{NaturalKey, SinkRecord};
//!
//! struct MyWarehouse { /* ... */ }
//!
//! impl SinkStore for MyWarehouse {
//!     fn contains_natural_key<'a>(&'a self, _key: &'a NaturalKey) -> BoxFuture<'a, SinkResult<bool>> {
//!         Box::pin(async move { Ok(false) })
//!     }
//!
//!     fn contains_uuid<'a>(&'a self, _uuid: &'a str) -> BoxFuture<'a, SinkResult<bool>> {
//!         Box::pin(async move { Ok(false) })
//!     }
//!
//!     fn insert<'a>(&'a self, _record: &'a SinkRecord) -> BoxFuture<'a, SinkResult<InsertOutcome>> {
//!         Box::pin(async move { Ok(InsertOutcome::Inserted) })
//!     }
//! }
//! ```

use crate::record::{NaturalKey, SinkRecord};
use crate::source::BoxFuture;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::RwLock;

/// Result type for sink operations.
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Errors a sink may report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The store could not be reached. The record is left for the next run.
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// The store refused this row (constraint other than uniqueness, bad type).
    #[error("sink rejected record: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Unavailable(_))
    }
}

/// Result of a single insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A uniqueness constraint fired; another writer got there first.
    Conflict,
}

/// Trait defining what we need from the sink store.
///
/// This trait allows testing with mocks and decouples the writer from any
/// particular database.
pub trait SinkStore: Send + Sync + 'static {
    /// Check if the sink is accepting writes (backpressure check).
    ///
    /// Default implementation returns `true` (always accept).
    fn should_accept_writes(&self) -> bool {
        true
    }

    /// Whether `insert` is atomic against the natural key, i.e. two
    /// concurrent inserts of the same key yield one `Inserted` and one
    /// `Conflict`. Required before the run will write from several tasks.
    fn supports_atomic_insert(&self) -> bool {
        false
    }

    /// Check if a row with this natural key already exists.
    fn contains_natural_key<'a>(&'a self, key: &'a NaturalKey) -> BoxFuture<'a, SinkResult<bool>>;

    /// Check if a row with this identity already exists.
    fn contains_uuid<'a>(&'a self, uuid: &'a str) -> BoxFuture<'a, SinkResult<bool>>;

    /// Insert one record. Never updates.
    fn insert<'a>(&'a self, record: &'a SinkRecord) -> BoxFuture<'a, SinkResult<InsertOutcome>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemorySink
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryTable {
    rows: Vec<SinkRecord>,
    by_key: HashMap<NaturalKey, usize>,
    uuids: HashSet<String>,
}

/// In-process sink with unique natural-key and identity indexes.
///
/// Inserts happen under one write lock, so it declares atomic insert.
#[derive(Default)]
pub struct MemorySink {
    table: RwLock<MemoryTable>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.rows.is_empty()
    }

    /// Snapshot of stored rows in insert order.
    pub async fn records(&self) -> Vec<SinkRecord> {
        self.table.read().await.rows.clone()
    }

    pub async fn get(&self, key: &NaturalKey) -> Option<SinkRecord> {
        let table = self.table.read().await;
        table.by_key.get(key).map(|&i| table.rows[i].clone())
    }
}

impl SinkStore for MemorySink {
    fn supports_atomic_insert(&self) -> bool {
        true
    }

    fn contains_natural_key<'a>(&'a self, key: &'a NaturalKey) -> BoxFuture<'a, SinkResult<bool>> {
        Box::pin(async move { Ok(self.table.read().await.by_key.contains_key(key)) })
    }

    fn contains_uuid<'a>(&'a self, uuid: &'a str) -> BoxFuture<'a, SinkResult<bool>> {
        Box::pin(async move { Ok(self.table.read().await.uuids.contains(uuid)) })
    }

    fn insert<'a>(&'a self, record: &'a SinkRecord) -> BoxFuture<'a, SinkResult<InsertOutcome>> {
        Box::pin(async move {
            let mut table = self.table.write().await;
            let key = record.record.natural_key();
            if table.by_key.contains_key(&key) || table.uuids.contains(&record.uuid) {
                return Ok(InsertOutcome::Conflict);
            }
            let pos = table.rows.len();
            table.rows.push(record.clone());
            table.by_key.insert(key, pos);
            table.uuids.insert(record.uuid.clone());
            Ok(InsertOutcome::Inserted)
        })
    }
}
