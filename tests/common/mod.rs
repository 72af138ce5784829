// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration, property and chaos tests.
//!
//! This module provides:
//! - `MockSource`: in-memory trail with call recording and injected failures
//! - `MockSink`: in-memory sink with injected failures, latency and
//!   concurrency tracking
//! - Record helpers

#![allow(dead_code)]

pub mod mock_sink;
pub mod mock_source;

pub use mock_sink::*;
pub use mock_source::*;

use audit_replicator::{AuditRecord, ReplicationConfig, ReplicationEngine};
use chrono::{NaiveDate, NaiveDateTime};
use std::sync::Arc;

pub fn base_timestamp() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 15)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap()
}

/// `n` records one second apart, `session-0000` oldest.
pub fn records(n: usize) -> Vec<AuditRecord> {
    (0..n)
        .map(|i| {
            let mut r = AuditRecord::new(
                "Standard",
                format!("session-{i:04}"),
                base_timestamp() + chrono::Duration::seconds(i as i64),
            );
            r.db_username = Some("APP_USER".to_string());
            r.action_name = Some("SELECT".to_string());
            r.sql_text = Some(format!("SELECT * FROM orders WHERE id = {i}"));
            r.return_code = Some(0);
            r
        })
        .collect()
}

/// Session id of the record at 1-based position `k` in fetch order when the
/// trail holds `records(n)` (newest first).
pub fn session_at_position(n: usize, k: usize) -> String {
    format!("session-{:04}", n - k)
}

pub fn config_with_page_size(page_size: u64) -> ReplicationConfig {
    let mut config = ReplicationConfig::for_testing();
    config.source.page_size = page_size;
    config
}

pub fn engine(
    config: ReplicationConfig,
    source: &Arc<MockSource>,
    sink: &Arc<MockSink>,
) -> ReplicationEngine<MockSource, MockSink> {
    ReplicationEngine::new(config, Arc::clone(source), Arc::clone(sink)).unwrap()
}
