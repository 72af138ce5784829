// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source store abstraction.
//!
//! The replicator only ever reads the source, and only through one call:
//! run a windowed query with a `(max_rows, offset)` binding pair and get back
//! column names plus positional rows. Any engine that can execute the page
//! query produced by [`PageQuery`](crate::pager::PageQuery) can be plugged in.
//!
//! # Implementations
//!
//! - [`MemorySource`]: in-process trail, applies the page window itself
//! - [`SqliteSource`](crate::sqlite::SqliteSource): runs the page SQL via sqlx

use crate::record::{AuditField, AuditRecord};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::RwLock;

/// Boxed future used by the source and sink capability traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type for source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Errors a source may report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The store could not be reached (network, pool exhausted, closed).
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the query.
    #[error("query rejected: {0}")]
    Query(String),
}

/// One cell of a source row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    TimestampUtc(DateTime<Utc>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampUtc(_) => "timestamp_utc",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Window bindings for the page query.
///
/// Numbered placeholders in the generated SQL: `?1` is `max_rows`, `?2` is
/// `offset`. Both are 1-based inclusive rank bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBindings {
    /// Last rank in the window (`offset + page_size` of the zero-based offset).
    pub max_rows: u64,
    /// First rank in the window.
    pub offset: u64,
}

/// Column header plus positional rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub column_names: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Read access to the system-of-record audit trail.
///
/// Implementations must be `Send + Sync` so the engine can share them
/// between the scheduler task and manual triggers.
pub trait SourceQuery: Send + Sync + 'static {
    /// Execute the page query with its window bindings.
    fn execute_query<'a>(
        &'a self,
        sql: &'a str,
        bindings: PageBindings,
    ) -> BoxFuture<'a, SourceResult<QueryResult>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemorySource
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process audit trail.
///
/// Ignores the SQL text and applies the same total order the page query
/// uses: `event_timestamp DESC, row_seq DESC`, where `row_seq` is the
/// insertion sequence. Useful standalone and as the base for test doubles.
#[derive(Default)]
pub struct MemorySource {
    rows: RwLock<Vec<(i64, AuditRecord)>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source from records in append order.
    pub fn with_records(records: impl IntoIterator<Item = AuditRecord>) -> Self {
        let rows = records
            .into_iter()
            .enumerate()
            .map(|(i, r)| (i as i64 + 1, r))
            .collect();
        Self {
            rows: RwLock::new(rows),
        }
    }

    /// Append an event, as the system of record would.
    pub async fn append(&self, record: AuditRecord) {
        let mut rows = self.rows.write().await;
        let seq = rows.last().map(|(s, _)| s + 1).unwrap_or(1);
        rows.push((seq, record));
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Column header emitted for every query: content fields, then the
    /// tie-break sequence, then the rank.
    pub fn column_names() -> Vec<String> {
        AuditField::ALL
            .iter()
            .filter(|f| f.is_content())
            .map(|f| f.column().to_ascii_uppercase())
            .chain(["ROW_SEQ".to_string(), "RNUM".to_string()])
            .collect()
    }

    async fn window(&self, bindings: PageBindings) -> SourceResult<QueryResult> {
        if bindings.offset == 0 {
            return Err(SourceError::Query("offset binding is 1-based".to_string()));
        }

        let rows = self.rows.read().await;
        let mut ordered: Vec<&(i64, AuditRecord)> = rows.iter().collect();
        ordered.sort_by(|(seq_a, a), (seq_b, b)| {
            b.event_timestamp
                .cmp(&a.event_timestamp)
                .then_with(|| seq_b.cmp(seq_a))
        });

        let start = (bindings.offset - 1) as usize;
        let end = (bindings.max_rows as usize).min(ordered.len());
        let rows = if start >= end {
            Vec::new()
        } else {
            ordered[start..end]
                .iter()
                .enumerate()
                .map(|(i, (seq, record))| {
                    AuditField::ALL
                        .iter()
                        .filter(|f| f.is_content())
                        .map(|f| record.value_of(*f))
                        .chain([Value::Integer(*seq), Value::Integer((start + i + 1) as i64)])
                        .collect()
                })
                .collect()
        };

        Ok(QueryResult {
            column_names: Self::column_names(),
            rows,
        })
    }
}

impl SourceQuery for MemorySource {
    fn execute_query<'a>(
        &'a self,
        _sql: &'a str,
        bindings: PageBindings,
    ) -> BoxFuture<'a, SourceResult<QueryResult>> {
        Box::pin(self.window(bindings))
    }
}
