// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offset pagination over the source trail.
//!
//! # Window Math
//!
//! ```text
//! page_number = n (1-based), page_size = p
//! offset      = (n - 1) * p
//! window      = ranks [offset + 1, offset + p]
//! bindings    = { max_rows: offset + p, offset: offset + 1 }
//! ```
//!
//! Ranks come from `ROW_NUMBER()` over a total order: the configured order
//! column descending, then the tie-break row sequence descending. Without the
//! tie-break, rows sharing a timestamp could swap between page fetches and be
//! skipped or seen twice.

use crate::config::{is_identifier, SourceConfig};
use crate::error::{ReplicationError, Result};
use crate::record::{AuditRecord, ColumnIndex, RecordError};
use crate::source::{PageBindings, SourceQuery};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Windowed page query built from validated identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    sql: String,
}

impl PageQuery {
    /// Build the query for a table ordered by `order_column` with a
    /// `tiebreak_column` sequence.
    pub fn new(table: &str, order_column: &str, tiebreak_column: &str) -> Result<Self> {
        for ident in [table, order_column, tiebreak_column] {
            if !is_identifier(ident) {
                return Err(ReplicationError::Config(format!(
                    "invalid identifier in page query: {ident:?}"
                )));
            }
        }
        if order_column.eq_ignore_ascii_case(tiebreak_column) {
            return Err(ReplicationError::Config(
                "page query needs a tie-break column distinct from the order column".to_string(),
            ));
        }

        let sql = format!(
            "SELECT * FROM (\
             SELECT src.*, ROW_NUMBER() OVER (ORDER BY src.{order} DESC, src.{tiebreak} DESC) AS rnum \
             FROM {table} src\
             ) ranked WHERE rnum BETWEEN ?2 AND ?1 ORDER BY rnum",
            order = order_column,
            tiebreak = tiebreak_column,
            table = table,
        );
        Ok(Self { sql })
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        Self::new(&config.table, &config.order_column, &config.tiebreak_column)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Compute the source bindings for one page.
pub fn page_bindings(page_number: u64, page_size: u64) -> Result<PageBindings> {
    if page_number == 0 {
        return Err(ReplicationError::query("page_number must be >= 1"));
    }
    if page_size == 0 {
        return Err(ReplicationError::query("page_size must be >= 1"));
    }
    let offset = (page_number - 1)
        .checked_mul(page_size)
        .ok_or_else(|| ReplicationError::query("page window overflows"))?;
    let max_rows = offset
        .checked_add(page_size)
        .ok_or_else(|| ReplicationError::query("page window overflows"))?;
    Ok(PageBindings {
        max_rows,
        offset: offset + 1,
    })
}

/// One page of decoded records.
#[derive(Debug, Clone)]
pub struct Page {
    pub number: u64,
    pub size: u64,
    pub records: Vec<AuditRecord>,
    /// Rows in the window that could not be mapped to a record.
    pub rejected: Vec<RecordError>,
}

impl Page {
    /// Rows the source returned, decoded or not.
    pub fn row_count(&self) -> u64 {
        (self.records.len() + self.rejected.len()) as u64
    }

    /// A page with fewer rows than requested is the last one.
    pub fn is_short(&self) -> bool {
        self.row_count() < self.size
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }
}

/// Fetches pages from a source.
pub struct Pager<Src: SourceQuery> {
    source: Arc<Src>,
    query: PageQuery,
}

impl<Src: SourceQuery> Pager<Src> {
    pub fn new(source: Arc<Src>, query: PageQuery) -> Self {
        Self { source, query }
    }

    pub fn query(&self) -> &PageQuery {
        &self.query
    }

    /// Fetch page `page_number` of `page_size` records.
    ///
    /// Invalid coordinates fail with `Query` before the source is called.
    /// Source errors are returned as-is and never retried here.
    pub async fn fetch_page(&self, page_number: u64, page_size: u64) -> Result<Page> {
        let bindings = page_bindings(page_number, page_size)?;

        let start = Instant::now();
        let result = match self.source.execute_query(self.query.sql(), bindings).await {
            Ok(result) => result,
            Err(e) => {
                crate::metrics::record_page_fetch_error(if matches!(e, crate::source::SourceError::Unavailable(_)) {
                    "unavailable"
                } else {
                    "query"
                });
                return Err(e.into());
            }
        };
        let elapsed = start.elapsed();

        let mut rows = result.rows;
        if rows.len() as u64 > page_size {
            warn!(
                page_number,
                page_size,
                returned = rows.len(),
                "Source returned more rows than the window holds, truncating"
            );
            rows.truncate(page_size as usize);
        }

        let index = ColumnIndex::new(&result.column_names);
        if !rows.is_empty() {
            let missing = index.missing_required();
            if !missing.is_empty() {
                warn!(page_number, ?missing, "Result set lacks required columns");
            }
        }

        let mut records = Vec::with_capacity(rows.len());
        let mut rejected = Vec::new();
        for row in &rows {
            match AuditRecord::from_row(&index, row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    debug!(page_number, error = %e, "Rejected source row");
                    rejected.push(e);
                }
            }
        }

        crate::metrics::record_page_fetch(rows.len(), elapsed);
        debug!(
            page_number,
            rows = rows.len(),
            rejected = rejected.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Fetched page"
        );

        Ok(Page {
            number: page_number,
            size: page_size,
            records,
            rejected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{BoxFuture, MemorySource, QueryResult, SourceError, SourceResult, Value};
    use chrono::NaiveDate;
    use std::sync::Mutex;

    fn records(n: usize) -> Vec<AuditRecord> {
        let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        (0..n)
            .map(|i| AuditRecord::new("Standard", format!("s{i}"), base + chrono::Duration::seconds(i as i64)))
            .collect()
    }

    fn pager(source: MemorySource) -> Pager<MemorySource> {
        Pager::new(Arc::new(source), PageQuery::from_config(&SourceConfig::default()).unwrap())
    }

    /// Records every binding it is called with.
    #[derive(Default)]
    struct RecordingSource {
        calls: Mutex<Vec<PageBindings>>,
    }

    impl SourceQuery for RecordingSource {
        fn execute_query<'a>(&'a self, _sql: &'a str, bindings: PageBindings) -> BoxFuture<'a, SourceResult<QueryResult>> {
            self.calls.lock().unwrap().push(bindings);
            Box::pin(async { Ok(QueryResult::default()) })
        }
    }

    struct DownSource;

    impl SourceQuery for DownSource {
        fn execute_query<'a>(&'a self, _sql: &'a str, _bindings: PageBindings) -> BoxFuture<'a, SourceResult<QueryResult>> {
            Box::pin(async { Err(SourceError::Unavailable("connection refused".into())) })
        }
    }

    #[test]
    fn test_page_bindings_math() {
        assert_eq!(page_bindings(1, 100).unwrap(), PageBindings { max_rows: 100, offset: 1 });
        assert_eq!(page_bindings(2, 100).unwrap(), PageBindings { max_rows: 200, offset: 101 });
        assert_eq!(page_bindings(3, 100).unwrap(), PageBindings { max_rows: 300, offset: 201 });
        assert_eq!(page_bindings(1, 1).unwrap(), PageBindings { max_rows: 1, offset: 1 });
    }

    #[test]
    fn test_page_bindings_rejects_zero_and_overflow() {
        assert!(matches!(page_bindings(0, 100), Err(ReplicationError::Query { .. })));
        assert!(matches!(page_bindings(1, 0), Err(ReplicationError::Query { .. })));
        assert!(matches!(page_bindings(u64::MAX, 2), Err(ReplicationError::Query { .. })));
    }

    #[test]
    fn test_page_query_contains_total_order() {
        let query = PageQuery::new("unified_audit_trail", "event_timestamp", "row_seq").unwrap();
        assert!(query.sql().contains("ORDER BY src.event_timestamp DESC, src.row_seq DESC"));
        assert!(query.sql().contains("BETWEEN ?2 AND ?1"));
    }

    #[test]
    fn test_page_query_rejects_injection() {
        assert!(PageQuery::new("t; DROP TABLE audit", "a", "b").is_err());
        assert!(PageQuery::new("t", "ts", "TS").is_err());
    }

    #[tokio::test]
    async fn test_zero_page_number_never_calls_source() {
        let source = Arc::new(RecordingSource::default());
        let pager = Pager::new(source.clone(), PageQuery::new("t", "a", "b").unwrap());
        assert!(pager.fetch_page(0, 10).await.is_err());
        assert!(pager.fetch_page(1, 0).await.is_err());
        assert!(source.calls.lock().unwrap().is_empty());

        pager.fetch_page(3, 10).await.unwrap();
        assert_eq!(source.calls.lock().unwrap()[0], PageBindings { max_rows: 30, offset: 21 });
    }

    #[tokio::test]
    async fn test_fetch_pages_of_250() {
        let pager = pager(MemorySource::with_records(records(250)));

        let p1 = pager.fetch_page(1, 100).await.unwrap();
        let p3 = pager.fetch_page(3, 100).await.unwrap();
        let p4 = pager.fetch_page(4, 100).await.unwrap();

        assert_eq!(p1.records.len(), 100);
        assert!(!p1.is_short());
        // Newest first.
        assert_eq!(p1.records[0].session_id, "s249");
        assert_eq!(p1.records[0].rnum, Some(1));
        assert_eq!(p3.records.len(), 50);
        assert!(p3.is_short());
        assert!(p4.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_source_propagates() {
        let pager = Pager::new(Arc::new(DownSource), PageQuery::new("t", "a", "b").unwrap());
        let err = pager.fetch_page(1, 10).await.unwrap_err();
        assert!(matches!(err, ReplicationError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_undecodable_rows_are_rejected_not_fatal() {
        struct HalfBad;
        impl SourceQuery for HalfBad {
            fn execute_query<'a>(&'a self, _sql: &'a str, _b: PageBindings) -> BoxFuture<'a, SourceResult<QueryResult>> {
                Box::pin(async {
                    Ok(QueryResult {
                        column_names: vec!["AUDIT_TYPE".into(), "SESSIONID".into(), "EVENT_TIMESTAMP".into()],
                        rows: vec![
                            vec![Value::Text("Standard".into()), Value::Text("ok".into()), Value::Text("2024-01-01 00:00:00".into())],
                            vec![Value::Text("Standard".into()), Value::Null, Value::Text("2024-01-01 00:00:00".into())],
                        ],
                    })
                })
            }
        }

        let pager = Pager::new(Arc::new(HalfBad), PageQuery::new("t", "a", "b").unwrap());
        let page = pager.fetch_page(1, 2).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.rejected.len(), 1);
        assert_eq!(page.row_count(), 2);
        assert!(!page.is_short());
    }
}
