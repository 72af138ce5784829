// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite adapters for both ends of the pipeline.
//!
//! - [`SqliteSource`] runs the generated page query against a local trail.
//! - [`SqliteSink`] stores replicated rows in an `audit` table with unique
//!   indexes on the natural key and on `uuid`.
//!
//! # Atomic Insert
//!
//! Inserts use `ON CONFLICT DO NOTHING`. Zero rows affected means another
//! writer already stored the key, which the writer reports as a duplicate.
//! This makes the sink safe for concurrent writer tasks.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Each operation retries with capped exponential backoff
//! before the error is surfaced. This is lock contention, not record retry.

use crate::config::SinkConfig;
use crate::error::{ReplicationError, Result};
use crate::record::{AuditField, AuditRecord, ColumnIndex, NaturalKey, SinkRecord};
use crate::sink::{InsertOutcome, SinkError, SinkResult, SinkStore};
use crate::source::{BoxFuture, PageBindings, QueryResult, SourceError, SourceQuery, SourceResult, Value};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, ConnectOptions, Connection, Row, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

static INSERT_SQL: LazyLock<String> = LazyLock::new(|| {
    let columns: Vec<&str> = AuditField::ALL.iter().map(|f| f.column()).collect();
    let placeholders: Vec<String> = (2..=columns.len() + 1).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO audit (uuid, {}) VALUES (?1, {}) ON CONFLICT DO NOTHING",
        columns.join(", "),
        placeholders.join(", ")
    )
});

const CREATE_AUDIT_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS audit (
        uuid TEXT NOT NULL,
        audit_type TEXT NOT NULL,
        sessionid TEXT NOT NULL,
        os_username TEXT,
        userhost TEXT,
        terminal TEXT,
        instance_id TEXT,
        dbid TEXT,
        authentication_type TEXT,
        dbusername TEXT,
        client_program_name TEXT,
        entry_id TEXT,
        statement_id TEXT,
        event_timestamp TEXT NOT NULL,
        event_timestamp_utc TEXT,
        action_name TEXT,
        return_code INTEGER,
        os_process TEXT,
        transaction_id TEXT,
        scn TEXT,
        object_schema TEXT,
        sql_text TEXT,
        rnum INTEGER
    )
"#;

const CREATE_NATURAL_KEY_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS audit_natural_key ON audit (sessionid, event_timestamp)";

const CREATE_UUID_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS audit_uuid ON audit (uuid)";

// ═══════════════════════════════════════════════════════════════════════════════
// Shared helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Errors that say nothing about the statement, only about reaching the store.
fn is_connectivity_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // SQLITE_CANTOPEN = 14
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("14") => true,
        other => is_sqlite_busy_error(other),
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_sqlite_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Decode a row by storage class, without a compile-time schema.
fn row_values(row: &SqliteRow) -> std::result::Result<Vec<Value>, sqlx::Error> {
    let mut values = Vec::with_capacity(row.len());
    for i in 0..row.len() {
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            values.push(Value::Null);
            continue;
        }
        let storage = raw.type_info().name().to_ascii_uppercase();
        let value = match storage.as_str() {
            "INTEGER" | "BOOLEAN" => Value::Integer(row.try_get_unchecked::<i64, _>(i)?),
            "REAL" => Value::Real(row.try_get_unchecked::<f64, _>(i)?),
            "BLOB" => {
                let bytes = row.try_get_unchecked::<Vec<u8>, _>(i)?;
                Value::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => Value::Text(row.try_get_unchecked::<String, _>(i)?),
        };
        values.push(value);
    }
    Ok(values)
}

fn column_names(row: &SqliteRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Integer(i) => query.bind(i),
        Value::Real(r) => query.bind(r),
        Value::Text(s) => query.bind(s),
        Value::Timestamp(t) => query.bind(t),
        Value::TimestampUtc(t) => query.bind(t),
    }
}

fn connect_options(path: &str, wal_mode: bool) -> Result<SqliteConnectOptions> {
    let url = if path == ":memory:" {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite://{}?mode=rwc", path)
    };
    let journal = if wal_mode {
        SqliteJournalMode::Wal
    } else {
        SqliteJournalMode::Delete
    };
    Ok(SqliteConnectOptions::from_str(&url)
        .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
        .journal_mode(journal)
        .synchronous(SqliteSynchronous::Normal)
        .create_if_missing(true))
}

/// Pool plus, for `:memory:`, one connection held outside the pool.
///
/// sqlx opens `:memory:` as a uniquely named shared-cache database, which
/// lives only while some connection to it is open. The held connection
/// keeps the table and its dedup state alive when the pool retires or
/// replaces its own connection.
struct Connected {
    pool: SqlitePool,
    anchor: Mutex<Option<SqliteConnection>>,
}

async fn connect(path: &str, wal_mode: bool) -> Result<Connected> {
    let options = connect_options(path, wal_mode)?;
    if path != ":memory:" {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        return Ok(Connected {
            pool,
            anchor: Mutex::new(None),
        });
    }

    let anchor = options.connect().await?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(Connected {
        pool,
        anchor: Mutex::new(Some(anchor)),
    })
}

async fn close_pool(pool: &SqlitePool, anchor: &Mutex<Option<SqliteConnection>>) {
    pool.close().await;
    if let Some(conn) = anchor.lock().await.take() {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Closing in-memory anchor connection failed");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SqliteSource
// ═══════════════════════════════════════════════════════════════════════════════

/// Source adapter over a local SQLite audit trail.
pub struct SqliteSource {
    pool: SqlitePool,
    anchor: Mutex<Option<SqliteConnection>>,
}

impl SqliteSource {
    /// Open the trail database at `path`.
    pub async fn open(path: &str) -> Result<Self> {
        info!(path = %path, "Opening SQLite audit source");
        let Connected { pool, anchor } = connect(path, false).await?;
        Ok(Self { pool, anchor })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            anchor: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool and release an in-memory database.
    pub async fn close(&self) {
        close_pool(&self.pool, &self.anchor).await;
    }

    async fn run(&self, sql: &str, bindings: PageBindings) -> SourceResult<QueryResult> {
        let max_rows = i64::try_from(bindings.max_rows)
            .map_err(|_| SourceError::Query(format!("max_rows {} out of range", bindings.max_rows)))?;
        let offset = i64::try_from(bindings.offset)
            .map_err(|_| SourceError::Query(format!("offset {} out of range", bindings.offset)))?;

        let rows = execute_with_retry("source_page", || {
            sqlx::query(sql).bind(max_rows).bind(offset).fetch_all(&self.pool)
        })
        .await
        .map_err(source_error)?;

        let column_names = rows.first().map(column_names).unwrap_or_default();
        let rows = rows
            .iter()
            .map(row_values)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(source_error)?;

        Ok(QueryResult { column_names, rows })
    }
}

fn source_error(e: sqlx::Error) -> SourceError {
    if is_connectivity_error(&e) {
        SourceError::Unavailable(e.to_string())
    } else {
        SourceError::Query(e.to_string())
    }
}

impl SourceQuery for SqliteSource {
    fn execute_query<'a>(
        &'a self,
        sql: &'a str,
        bindings: PageBindings,
    ) -> BoxFuture<'a, SourceResult<QueryResult>> {
        Box::pin(self.run(sql, bindings))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SqliteSink
// ═══════════════════════════════════════════════════════════════════════════════

/// Sink adapter storing replicated rows in a local SQLite `audit` table.
pub struct SqliteSink {
    pool: SqlitePool,
    anchor: Mutex<Option<SqliteConnection>>,
    path: String,
}

impl SqliteSink {
    /// Open the sink database and create the table and indexes if missing.
    pub async fn open(config: &SinkConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, wal = config.wal_mode, "Initializing SQLite audit sink");

        let Connected { pool, anchor } = connect(&config.sqlite_path, config.wal_mode).await?;
        for ddl in [CREATE_AUDIT_TABLE, CREATE_NATURAL_KEY_INDEX, CREATE_UUID_INDEX] {
            sqlx::query(ddl).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            anchor,
            path: config.sqlite_path.clone(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of stored rows.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Read back the row stored under a natural key.
    pub async fn fetch(&self, key: &NaturalKey) -> Result<Option<SinkRecord>> {
        let row = sqlx::query("SELECT * FROM audit WHERE sessionid = ?1 AND event_timestamp = ?2")
            .bind(&key.session_id)
            .bind(key.event_timestamp)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let index = ColumnIndex::new(&column_names(&row));
        let record = AuditRecord::from_row(&index, &row_values(&row)?)?;
        let uuid: String = row.try_get("uuid")?;
        Ok(Some(SinkRecord { uuid, record }))
    }

    /// Close the pool. Pending operations finish first. An in-memory
    /// database is discarded.
    pub async fn close(&self) {
        close_pool(&self.pool, &self.anchor).await;
    }

    async fn exists(&self, operation: &str, sql: &str, first: String, second: Option<chrono::NaiveDateTime>) -> SinkResult<bool> {
        let found = execute_with_retry(operation, || {
            let query = sqlx::query_scalar::<_, i64>(sql).bind(first.clone());
            let query = match second {
                Some(ts) => query.bind(ts),
                None => query,
            };
            query.fetch_optional(&self.pool)
        })
        .await
        .map_err(sink_error)?;
        Ok(found.is_some())
    }

    async fn insert_row(&self, row: &SinkRecord) -> SinkResult<InsertOutcome> {
        let result = execute_with_retry("sink_insert", || {
            let mut query = sqlx::query(INSERT_SQL.as_str()).bind(row.uuid.clone());
            for field in AuditField::ALL {
                query = bind_value(query, row.record.value_of(field));
            }
            query.execute(&self.pool)
        })
        .await
        .map_err(sink_error)?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Conflict)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }
}

fn sink_error(e: sqlx::Error) -> SinkError {
    if is_connectivity_error(&e) {
        SinkError::Unavailable(e.to_string())
    } else {
        SinkError::Rejected(e.to_string())
    }
}

impl SinkStore for SqliteSink {
    fn supports_atomic_insert(&self) -> bool {
        true
    }

    fn should_accept_writes(&self) -> bool {
        !self.pool.is_closed()
    }

    fn contains_natural_key<'a>(&'a self, key: &'a NaturalKey) -> BoxFuture<'a, SinkResult<bool>> {
        Box::pin(self.exists(
            "sink_contains_key",
            "SELECT 1 FROM audit WHERE sessionid = ?1 AND event_timestamp = ?2 LIMIT 1",
            key.session_id.clone(),
            Some(key.event_timestamp),
        ))
    }

    fn contains_uuid<'a>(&'a self, uuid: &'a str) -> BoxFuture<'a, SinkResult<bool>> {
        Box::pin(self.exists(
            "sink_contains_uuid",
            "SELECT 1 FROM audit WHERE uuid = ?1 LIMIT 1",
            uuid.to_string(),
            None,
        ))
    }

    fn insert<'a>(&'a self, record: &'a SinkRecord) -> BoxFuture<'a, SinkResult<InsertOutcome>> {
        Box::pin(self.insert_row(record))
    }
}
