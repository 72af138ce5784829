// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Audit Replicator
//!
//! Scheduled replication of an append-only audit trail into an analytical
//! store, paging through arbitrarily large result sets without duplicating
//! or losing records between runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            audit-replicator                               │
//! │                                                                           │
//! │  ┌───────────┐   ┌───────────────┐   ┌───────┐   ┌──────────────────────┐ │
//! │  │ Scheduler │──►│ ReplicationRun│──►│ Pager │──►│ SourceQuery          │ │
//! │  │ (RunGate) │   │ (per run)     │   │       │   │ (system of record)   │ │
//! │  └───────────┘   └───────────────┘   └───────┘   └──────────────────────┘ │
//! │                          │                                                │
//! │                          ▼ per record                                     │
//! │              ┌─────────────────────┐   ┌────────────┐   ┌──────────────┐  │
//! │              │ RecordFingerprinter │──►│ SinkWriter │──►│ SinkStore    │  │
//! │              │ (sanitize, identity)│   │ (dedup)    │   │ (analytical) │  │
//! │              └─────────────────────┘   └────────────┘   └──────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is at-least-once fetch with dedup-on-write: every run re-reads
//! from the newest page, and the sink's natural-key check turns re-reads
//! into skips.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use audit_replicator::{ReplicationConfig, ReplicationEngine, SqliteSink, SqliteSource};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> audit_replicator::Result<()> {
//!     let config = ReplicationConfig::default();
//!     let source = Arc::new(SqliteSource::open("trail.db").await?);
//!     let sink = Arc::new(SqliteSink::open(&config.sink).await?);
//!
//!     let mut engine = ReplicationEngine::new(config, source, sink)?;
//!     engine.start().await?;
//!
//!     // Runs every 60s until shutdown
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod pager;
pub mod record;
pub mod resilience;
pub mod sink;
pub mod source;
pub mod sqlite;
pub mod writer;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use config::{ReplicationConfig, ScheduleConfig, SinkConfig, SloConfig, SourceConfig, WriterConfig};
pub use coordinator::{EngineState, HealthCheck, ReplicationEngine, ReplicationRun, RunStatus, RunSummary};
pub use error::{ReplicationError, Result};
pub use fingerprint::{IdentityStrategy, NormalizationRule, RecordFingerprinter};
pub use pager::{Page, PageQuery, Pager};
pub use record::{AuditRecord, NaturalKey, RecordError, SinkRecord};
pub use sink::{InsertOutcome, MemorySink, SinkError, SinkStore};
pub use source::{MemorySource, PageBindings, QueryResult, SourceError, SourceQuery, Value};
pub use sqlite::{SqliteSink, SqliteSource};
pub use writer::{DuplicateReason, FailureReason, SinkWriter, WriteOutcome};
