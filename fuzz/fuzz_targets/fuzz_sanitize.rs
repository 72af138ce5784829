//! Fuzz target for record sanitization.
//!
//! `sanitize` must be total: arbitrary text in any field never panics, and
//! no NUL survives.

#![no_main]

use audit_replicator::{AuditRecord, RecordFingerprinter};
use chrono::NaiveDate;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str, &str)| {
    let (session, sql, terminal) = data;
    let Some(ts) = NaiveDate::from_ymd_opt(2024, 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0)) else {
        return;
    };

    let mut record = AuditRecord::new("Standard", session, ts);
    record.sql_text = Some(sql.to_string());
    record.terminal = Some(terminal.to_string());

    let fingerprinter = RecordFingerprinter::default();
    let clean = fingerprinter.sanitize(record);
    assert!(!clean.session_id.contains('\0'));
    assert!(!clean.sql_text.as_deref().unwrap_or_default().contains('\0'));

    // Should never panic
    let _ = fingerprinter.content_fingerprint(&clean);
});
