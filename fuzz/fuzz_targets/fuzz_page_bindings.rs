//! Fuzz target for page window math.
//!
//! `page_bindings` must never panic or overflow: it either returns a window
//! of exactly `page_size` ranks or an error.

#![no_main]

use audit_replicator::pager::page_bindings;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u64, u64)| {
    let (page_number, page_size) = data;

    if let Ok(window) = page_bindings(page_number, page_size) {
        assert!(window.offset >= 1);
        assert_eq!(window.max_rows - window.offset + 1, page_size);
    }
});
