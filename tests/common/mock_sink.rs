//! Mock SinkStore for testing.
//!
//! Wraps `MemorySink` (atomic insert) and adds:
//! - transient failures for chosen sessions or every n-th insert
//! - a full outage switch
//! - backpressure (`should_accept_writes() == false`)
//! - per-insert latency and tracking of concurrent inserts
//! - an option to hide atomic insert support

use audit_replicator::source::BoxFuture;
use audit_replicator::{InsertOutcome, MemorySink, NaturalKey, SinkError, SinkRecord, SinkStore};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct MockSink {
    inner: MemorySink,
    atomic: bool,
    outage: AtomicBool,
    paused: AtomicBool,
    failing_sessions: Mutex<HashSet<String>>,
    /// Fail every n-th insert call, 0 for never
    fail_every: AtomicUsize,
    delay: Mutex<Duration>,

    calls: AtomicUsize,
    insert_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockSink {
    pub fn new() -> Self {
        Self {
            inner: MemorySink::new(),
            atomic: true,
            outage: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            failing_sessions: Mutex::new(HashSet::new()),
            fail_every: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            insert_calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// A sink that does not declare atomic insert.
    pub fn non_atomic() -> Self {
        Self {
            atomic: false,
            ..Self::new()
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = delay;
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fail_session(&self, session_id: impl Into<String>) {
        self.failing_sessions.lock().unwrap().insert(session_id.into());
    }

    pub fn fail_every(&self, n: usize) {
        self.fail_every.store(n, Ordering::SeqCst);
    }

    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Clear every injected failure.
    pub fn heal(&self) {
        self.failing_sessions.lock().unwrap().clear();
        self.fail_every.store(0, Ordering::SeqCst);
        self.outage.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.inner.len().await
    }

    pub async fn records(&self) -> Vec<SinkRecord> {
        self.inner.records().await
    }

    pub async fn get(&self, key: &NaturalKey) -> Option<SinkRecord> {
        self.inner.get(key).await
    }

    /// Calls that reached the sink (existence checks and inserts).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Highest number of inserts observed in flight at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn down(&self) -> Option<SinkError> {
        self.outage
            .load(Ordering::SeqCst)
            .then(|| SinkError::Unavailable("connection reset by peer".to_string()))
    }
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkStore for MockSink {
    fn should_accept_writes(&self) -> bool {
        !self.paused.load(Ordering::SeqCst)
    }

    fn supports_atomic_insert(&self) -> bool {
        self.atomic
    }

    fn contains_natural_key<'a>(&'a self, key: &'a NaturalKey) -> BoxFuture<'a, Result<bool, SinkError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if let Some(e) = self.down() {
                return Err(e);
            }
            self.inner.contains_natural_key(key).await
        })
    }

    fn contains_uuid<'a>(&'a self, uuid: &'a str) -> BoxFuture<'a, Result<bool, SinkError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if let Some(e) = self.down() {
                return Err(e);
            }
            self.inner.contains_uuid(uuid).await
        })
    }

    fn insert<'a>(&'a self, record: &'a SinkRecord) -> BoxFuture<'a, Result<InsertOutcome, SinkError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let call = self.insert_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let every = self.fail_every.load(Ordering::SeqCst);
            let injected = self.down().or_else(|| {
                let session_fails = self
                    .failing_sessions
                    .lock()
                    .unwrap()
                    .contains(&record.record.session_id);
                (session_fails || (every > 0 && call % every == 0))
                    .then(|| SinkError::Unavailable("write timed out".to_string()))
            });

            let result = match injected {
                Some(e) => Err(e),
                None => self.inner.insert(record).await,
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}
