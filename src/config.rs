// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the audit replicator.
//!
//! All configuration is passed to
//! [`ReplicationEngine::new()`](crate::ReplicationEngine::new) and can be built
//! programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use audit_replicator::config::{ReplicationConfig, SourceConfig};
//!
//! let config = ReplicationConfig {
//!     source: SourceConfig {
//!         page_size: 250,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── source: SourceConfig       # Table, ordering, page size
//! ├── sink: SinkConfig           # SQLite path, identity strategy
//! ├── schedule: ScheduleConfig   # Tick interval, run deadline
//! ├── writer: WriterConfig       # Concurrency, rate limit, circuit breaker
//! └── slo: SloConfig             # SLO thresholds
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! source:
//!   table: "unified_audit_trail"
//!   order_column: "event_timestamp"
//!   tiebreak_column: "row_seq"
//!   page_size: 100
//!
//! sink:
//!   sqlite_path: "/var/lib/audit/replica.db"
//!   identity: "random"
//!
//! schedule:
//!   interval: "5m"
//!   run_deadline: "4m"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{ReplicationError, Result};
use crate::fingerprint::IdentityStrategy;
use crate::resilience::RateLimitConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$.]*$").expect("identifier pattern is valid")
});

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub slo: SloConfig,
}

impl ReplicationConfig {
    /// Create a minimal config for testing.
    ///
    /// Ticks are disabled so only the manual trigger runs, and the sink
    /// lives in memory.
    pub fn for_testing() -> Self {
        Self {
            source: SourceConfig::default(),
            sink: SinkConfig::in_memory(),
            schedule: ScheduleConfig {
                enabled: false,
                ..Default::default()
            },
            writer: WriterConfig::default(),
            slo: SloConfig::default(),
        }
    }

    /// Reject configurations the engine cannot run safely.
    pub fn validate(&self) -> Result<()> {
        self.source.validate()?;
        self.schedule.validate()?;
        self.writer.validate()?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig: which relation to page through and how
// ═══════════════════════════════════════════════════════════════════════════════

/// Source relation and paging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Relation holding the audit trail.
    #[serde(default = "default_table")]
    pub table: String,

    /// Primary ordering column (newest first).
    #[serde(default = "default_order_column")]
    pub order_column: String,

    /// Monotonic row sequence used to break timestamp ties.
    #[serde(default = "default_tiebreak_column")]
    pub tiebreak_column: String,

    /// Records per page.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

fn default_table() -> String {
    "unified_audit_trail".to_string()
}

fn default_order_column() -> String {
    "event_timestamp".to_string()
}

fn default_tiebreak_column() -> String {
    "row_seq".to_string()
}

fn default_page_size() -> u64 {
    100
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            order_column: default_order_column(),
            tiebreak_column: default_tiebreak_column(),
            page_size: default_page_size(),
        }
    }
}

impl SourceConfig {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("table", &self.table),
            ("order_column", &self.order_column),
            ("tiebreak_column", &self.tiebreak_column),
        ] {
            if !is_identifier(value) {
                return Err(ReplicationError::Config(format!(
                    "source.{name} is not a valid identifier: {value:?}"
                )));
            }
        }
        if self.tiebreak_column.eq_ignore_ascii_case(&self.order_column) {
            return Err(ReplicationError::Config(
                "source.tiebreak_column must differ from source.order_column".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(ReplicationError::Config("source.page_size must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Check a table or column name against the allowed identifier shape.
pub fn is_identifier(value: &str) -> bool {
    IDENTIFIER.is_match(value)
}

// ═══════════════════════════════════════════════════════════════════════════════
// SinkConfig: downstream store
// ═══════════════════════════════════════════════════════════════════════════════

/// Sink store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Path to the SQLite sink database (used by `SqliteSink`).
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// How sink row identities are assigned.
    #[serde(default)]
    pub identity: IdentityStrategy,
}

fn default_sqlite_path() -> String {
    "audit_replica.db".to_string()
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            wal_mode: true,
            identity: IdentityStrategy::default(),
        }
    }
}

impl SinkConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            identity: IdentityStrategy::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ScheduleConfig: periodic trigger
// ═══════════════════════════════════════════════════════════════════════════════

/// Periodic trigger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Whether the periodic trigger runs. When off, only `run_once` does.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tick period as a duration string (e.g., "60s", "5m").
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Optional wall-clock budget for one run (e.g., "4m").
    /// A run past its deadline stops between records and is reported abandoned.
    #[serde(default)]
    pub run_deadline: Option<String>,
}

fn default_interval() -> String {
    "60s".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval(),
            run_deadline: None,
        }
    }
}

impl ScheduleConfig {
    /// Parse the interval string to a Duration.
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(60))
    }

    /// Parse the run deadline, if any.
    pub fn run_deadline_duration(&self) -> Option<Duration> {
        self.run_deadline
            .as_deref()
            .and_then(|d| humantime::parse_duration(d).ok())
    }

    fn validate(&self) -> Result<()> {
        match humantime::parse_duration(&self.interval) {
            Ok(d) if d.is_zero() => {
                return Err(ReplicationError::Config("schedule.interval must be > 0".to_string()))
            }
            Ok(_) => {}
            Err(e) => {
                return Err(ReplicationError::Config(format!(
                    "schedule.interval {:?} is not a duration: {e}",
                    self.interval
                )))
            }
        }
        if let Some(deadline) = &self.run_deadline {
            humantime::parse_duration(deadline).map_err(|e| {
                ReplicationError::Config(format!(
                    "schedule.run_deadline {deadline:?} is not a duration: {e}"
                ))
            })?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WriterConfig: sink write path
// ═══════════════════════════════════════════════════════════════════════════════

/// Sink writer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Number of concurrent writer tasks. `1` writes strictly in page order.
    /// Values above 1 take effect only for sinks with atomic insert.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Bounded channel between the page fetcher and the writer tasks.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────

    /// Throttle sink writes with a token bucket.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Maximum writes per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size for rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    // ─────────────────────────────────────────────────────────────────────────
    // Circuit Breaker
    // ─────────────────────────────────────────────────────────────────────────

    /// Failure rate (0.0 - 1.0) over the observation window that opens the circuit.
    #[serde(default = "default_circuit_failure_rate")]
    pub circuit_failure_rate: f32,

    /// Number of recent sink calls the failure rate is computed over.
    #[serde(default = "default_circuit_window")]
    pub circuit_window: usize,

    /// Trial calls allowed while half-open.
    #[serde(default = "default_circuit_probe_calls")]
    pub circuit_probe_calls: usize,

    /// How long the circuit stays open before probing, as a duration string.
    #[serde(default = "default_circuit_recovery")]
    pub circuit_recovery: String,
}

fn default_concurrency() -> usize {
    1
}

fn default_channel_capacity() -> usize {
    256
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn default_circuit_failure_rate() -> f32 {
    0.5
}

fn default_circuit_window() -> usize {
    20
}

fn default_circuit_probe_calls() -> usize {
    3
}

fn default_circuit_recovery() -> String {
    "30s".to_string()
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            channel_capacity: default_channel_capacity(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            circuit_failure_rate: default_circuit_failure_rate(),
            circuit_window: default_circuit_window(),
            circuit_probe_calls: default_circuit_probe_calls(),
            circuit_recovery: default_circuit_recovery(),
        }
    }
}

impl WriterConfig {
    /// Create rate limit configuration from writer settings.
    ///
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }

    /// Circuit breaker configuration for sink calls.
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_rate: self.circuit_failure_rate,
            window: self.circuit_window,
            probe_calls: self.circuit_probe_calls,
            recovery_timeout: humantime::parse_duration(&self.circuit_recovery)
                .unwrap_or(Duration::from_secs(30)),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ReplicationError::Config("writer.concurrency must be > 0".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(ReplicationError::Config(
                "writer.channel_capacity must be > 0".to_string(),
            ));
        }
        if !(self.circuit_failure_rate > 0.0 && self.circuit_failure_rate <= 1.0) {
            return Err(ReplicationError::Config(
                "writer.circuit_failure_rate must be in (0, 1]".to_string(),
            ));
        }
        if self.circuit_window == 0 || self.circuit_probe_calls == 0 {
            return Err(ReplicationError::Config(
                "writer.circuit_window and writer.circuit_probe_calls must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SloConfig: Service Level Objectives for alerting
// ═══════════════════════════════════════════════════════════════════════════════

/// SLO thresholds for detecting performance degradation.
///
/// Violations are logged at `warn!` and never change run behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    /// Maximum acceptable page fetch latency (ms).
    #[serde(default = "default_max_page_fetch_latency_ms")]
    pub max_page_fetch_latency_ms: u64,

    /// Maximum acceptable run duration (ms).
    #[serde(default = "default_max_run_duration_ms")]
    pub max_run_duration_ms: u64,
}

fn default_max_page_fetch_latency_ms() -> u64 {
    2_000
}

fn default_max_run_duration_ms() -> u64 {
    300_000 // 5 minutes, one legacy tick
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_page_fetch_latency_ms: default_max_page_fetch_latency_ms(),
            max_run_duration_ms: default_max_run_duration_ms(),
        }
    }
}

impl SloConfig {
    /// Check if a page fetch latency violates SLO.
    pub fn is_page_fetch_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_page_fetch_latency_ms
    }

    /// Check if a run duration violates SLO.
    pub fn is_run_duration_violation(&self, duration: Duration) -> bool {
        duration.as_millis() as u64 > self.max_run_duration_ms
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
