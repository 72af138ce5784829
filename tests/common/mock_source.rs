//! Mock SourceQuery for testing.
//!
//! Wraps `MemorySource` and records every page binding it is asked for.
//! Failures can be injected on a specific call number.

use audit_replicator::source::BoxFuture;
use audit_replicator::{AuditRecord, MemorySource, PageBindings, QueryResult, SourceError, SourceQuery};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Which error an injected failure produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFault {
    Unavailable,
    Query,
}

pub struct MockSource {
    inner: MemorySource,
    calls: Mutex<Vec<PageBindings>>,
    /// 1-based call number that fails, `usize::MAX` for none
    fail_on_call: AtomicUsize,
    fault: Mutex<SourceFault>,
    delay: Mutex<Duration>,
}

impl MockSource {
    pub fn new(records: Vec<AuditRecord>) -> Self {
        Self {
            inner: MemorySource::with_records(records),
            calls: Mutex::new(Vec::new()),
            fail_on_call: AtomicUsize::new(usize::MAX),
            fault: Mutex::new(SourceFault::Unavailable),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Fail the `call`-th query (counting every call so far, 1-based).
    pub fn fail_on_call(&self, call: usize, fault: SourceFault) {
        *self.fault.lock().unwrap() = fault;
        self.fail_on_call.store(call, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail_on_call.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub async fn append(&self, record: AuditRecord) {
        self.inner.append(record).await;
    }

    /// Every binding requested so far, in call order.
    pub fn calls(&self) -> Vec<PageBindings> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl SourceQuery for MockSource {
    fn execute_query<'a>(
        &'a self,
        sql: &'a str,
        bindings: PageBindings,
    ) -> BoxFuture<'a, Result<QueryResult, SourceError>> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(bindings);
            calls.len()
        };
        let fail = call == self.fail_on_call.load(Ordering::SeqCst);
        let fault = *self.fault.lock().unwrap();
        let delay = *self.delay.lock().unwrap();

        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if fail {
                return Err(match fault {
                    SourceFault::Unavailable => SourceError::Unavailable("connection refused".to_string()),
                    SourceFault::Query => SourceError::Query("ORA-00942: table or view does not exist".to_string()),
                });
            }
            self.inner.execute_query(sql, bindings).await
        })
    }
}
