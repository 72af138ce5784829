// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Audit records and the source-to-record field mapping.
//!
//! Source rows arrive as positional [`Value`]s plus column names. The mapping
//! onto [`AuditRecord`] is a fixed list of [`AuditField`] descriptors, each with
//! its column name and [`FieldKind`]. Column names match case-insensitively;
//! unknown columns are ignored and missing optional columns become `None`.
//!
//! ```text
//! QueryResult { column_names, rows }
//!        │
//!        ▼  ColumnIndex::new(column_names)   (once per page)
//!        │
//!        ▼  AuditRecord::from_row(&index, row)
//!   AuditRecord ──► RecordFingerprinter::sanitize ──► SinkWriter::write
//!                                                        │
//!                                                        ▼
//!                                             SinkRecord { uuid, record }
//! ```

use crate::source::Value;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Why a source row could not become an [`AuditRecord`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    /// A required column is absent from the result set or NULL in this row.
    #[error("missing required column {0}")]
    MissingColumn(&'static str),

    /// The column holds a value that cannot convert to the field's type.
    #[error("invalid value for column {column}: {message}")]
    InvalidValue {
        column: &'static str,
        message: String,
    },

    /// Row width does not match the column header.
    #[error("row has {actual} values but result set has {expected} columns")]
    RowShape { expected: usize, actual: usize },
}

// ═══════════════════════════════════════════════════════════════════════════════
// AuditRecord
// ═══════════════════════════════════════════════════════════════════════════════

/// One immutable event from the source audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_type: String,
    pub session_id: String,
    pub os_username: Option<String>,
    pub user_host: Option<String>,
    pub terminal: Option<String>,
    pub instance_id: Option<String>,
    pub db_id: Option<String>,
    pub authentication_type: Option<String>,
    pub db_username: Option<String>,
    pub client_program_name: Option<String>,
    pub entry_id: Option<String>,
    pub statement_id: Option<String>,
    /// Local event time. Half of the natural key.
    pub event_timestamp: NaiveDateTime,
    pub event_timestamp_utc: Option<DateTime<Utc>>,
    pub action_name: Option<String>,
    pub return_code: Option<i64>,
    pub os_process: Option<String>,
    pub transaction_id: Option<String>,
    pub scn: Option<String>,
    pub object_schema: Option<String>,
    /// Statement text. Arbitrarily long, may carry control bytes until sanitized.
    pub sql_text: Option<String>,
    /// 1-based rank in the ordered source window. Page position, not content.
    pub rnum: Option<i64>,
}

impl AuditRecord {
    /// Minimal record with only the required fields set.
    pub fn new(
        audit_type: impl Into<String>,
        session_id: impl Into<String>,
        event_timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            audit_type: audit_type.into(),
            session_id: session_id.into(),
            os_username: None,
            user_host: None,
            terminal: None,
            instance_id: None,
            db_id: None,
            authentication_type: None,
            db_username: None,
            client_program_name: None,
            entry_id: None,
            statement_id: None,
            event_timestamp,
            event_timestamp_utc: None,
            action_name: None,
            return_code: None,
            os_process: None,
            transaction_id: None,
            scn: None,
            object_schema: None,
            sql_text: None,
            rnum: None,
        }
    }

    /// Map one positional source row through the field list.
    pub fn from_row(index: &ColumnIndex, row: &[Value]) -> Result<Self, RecordError> {
        if row.len() != index.width {
            return Err(RecordError::RowShape {
                expected: index.width,
                actual: row.len(),
            });
        }

        let mut partial = PartialRecord::default();
        for field in AuditField::ALL {
            if let Some(&pos) = index.positions.get(field.column()) {
                partial.set(field, &row[pos])?;
            }
        }
        partial.finish()
    }

    /// The natural identity of this record: `(session_id, event_timestamp)`.
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            session_id: self.session_id.clone(),
            event_timestamp: self.event_timestamp,
        }
    }

    /// Read one field back as a source value.
    pub fn value_of(&self, field: AuditField) -> Value {
        use AuditField::*;
        match field {
            AuditType => Value::Text(self.audit_type.clone()),
            SessionId => Value::Text(self.session_id.clone()),
            OsUsername => text(&self.os_username),
            UserHost => text(&self.user_host),
            Terminal => text(&self.terminal),
            InstanceId => text(&self.instance_id),
            DbId => text(&self.db_id),
            AuthenticationType => text(&self.authentication_type),
            DbUsername => text(&self.db_username),
            ClientProgramName => text(&self.client_program_name),
            EntryId => text(&self.entry_id),
            StatementId => text(&self.statement_id),
            EventTimestamp => Value::Timestamp(self.event_timestamp),
            EventTimestampUtc => self
                .event_timestamp_utc
                .map(Value::TimestampUtc)
                .unwrap_or(Value::Null),
            ActionName => text(&self.action_name),
            ReturnCode => self.return_code.map(Value::Integer).unwrap_or(Value::Null),
            OsProcess => text(&self.os_process),
            TransactionId => text(&self.transaction_id),
            Scn => text(&self.scn),
            ObjectSchema => text(&self.object_schema),
            SqlText => text(&self.sql_text),
            Rnum => self.rnum.map(Value::Integer).unwrap_or(Value::Null),
        }
    }

    /// Visit every text-valued field mutably, required and optional alike.
    pub fn for_each_text_mut(&mut self, mut f: impl FnMut(AuditField, &mut String)) {
        f(AuditField::AuditType, &mut self.audit_type);
        f(AuditField::SessionId, &mut self.session_id);
        let optional: [(AuditField, &mut Option<String>); 16] = [
            (AuditField::OsUsername, &mut self.os_username),
            (AuditField::UserHost, &mut self.user_host),
            (AuditField::Terminal, &mut self.terminal),
            (AuditField::InstanceId, &mut self.instance_id),
            (AuditField::DbId, &mut self.db_id),
            (AuditField::AuthenticationType, &mut self.authentication_type),
            (AuditField::DbUsername, &mut self.db_username),
            (AuditField::ClientProgramName, &mut self.client_program_name),
            (AuditField::EntryId, &mut self.entry_id),
            (AuditField::StatementId, &mut self.statement_id),
            (AuditField::ActionName, &mut self.action_name),
            (AuditField::OsProcess, &mut self.os_process),
            (AuditField::TransactionId, &mut self.transaction_id),
            (AuditField::Scn, &mut self.scn),
            (AuditField::ObjectSchema, &mut self.object_schema),
            (AuditField::SqlText, &mut self.sql_text),
        ];
        for (field, slot) in optional {
            if let Some(value) = slot.as_mut() {
                f(field, value);
            }
        }
    }
}

fn text(value: &Option<String>) -> Value {
    value.clone().map(Value::Text).unwrap_or(Value::Null)
}

/// `(session_id, event_timestamp)`, the key the sink deduplicates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub session_id: String,
    pub event_timestamp: NaiveDateTime,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.session_id, self.event_timestamp)
    }
}

/// A record as persisted in the sink: the audit fields plus the identity
/// assigned at first successful write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRecord {
    pub uuid: String,
    pub record: AuditRecord,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Field list
// ═══════════════════════════════════════════════════════════════════════════════

/// How a column's source value converts into its record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    RequiredText,
    Integer,
    LocalTimestamp,
    RequiredLocalTimestamp,
    UtcTimestamp,
}

/// One column of the audit trail, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditField {
    AuditType,
    SessionId,
    OsUsername,
    UserHost,
    Terminal,
    InstanceId,
    DbId,
    AuthenticationType,
    DbUsername,
    ClientProgramName,
    EntryId,
    StatementId,
    EventTimestamp,
    EventTimestampUtc,
    ActionName,
    ReturnCode,
    OsProcess,
    TransactionId,
    Scn,
    ObjectSchema,
    SqlText,
    Rnum,
}

impl AuditField {
    pub const ALL: [AuditField; 22] = [
        AuditField::AuditType,
        AuditField::SessionId,
        AuditField::OsUsername,
        AuditField::UserHost,
        AuditField::Terminal,
        AuditField::InstanceId,
        AuditField::DbId,
        AuditField::AuthenticationType,
        AuditField::DbUsername,
        AuditField::ClientProgramName,
        AuditField::EntryId,
        AuditField::StatementId,
        AuditField::EventTimestamp,
        AuditField::EventTimestampUtc,
        AuditField::ActionName,
        AuditField::ReturnCode,
        AuditField::OsProcess,
        AuditField::TransactionId,
        AuditField::Scn,
        AuditField::ObjectSchema,
        AuditField::SqlText,
        AuditField::Rnum,
    ];

    /// Lower-case column name, shared by the source trail and the sink table.
    pub const fn column(self) -> &'static str {
        use AuditField::*;
        match self {
            AuditType => "audit_type",
            SessionId => "sessionid",
            OsUsername => "os_username",
            UserHost => "userhost",
            Terminal => "terminal",
            InstanceId => "instance_id",
            DbId => "dbid",
            AuthenticationType => "authentication_type",
            DbUsername => "dbusername",
            ClientProgramName => "client_program_name",
            EntryId => "entry_id",
            StatementId => "statement_id",
            EventTimestamp => "event_timestamp",
            EventTimestampUtc => "event_timestamp_utc",
            ActionName => "action_name",
            ReturnCode => "return_code",
            OsProcess => "os_process",
            TransactionId => "transaction_id",
            Scn => "scn",
            ObjectSchema => "object_schema",
            SqlText => "sql_text",
            Rnum => "rnum",
        }
    }

    pub const fn kind(self) -> FieldKind {
        use AuditField::*;
        match self {
            AuditType | SessionId => FieldKind::RequiredText,
            EventTimestamp => FieldKind::RequiredLocalTimestamp,
            EventTimestampUtc => FieldKind::UtcTimestamp,
            ReturnCode | Rnum => FieldKind::Integer,
            _ => FieldKind::Text,
        }
    }

    /// Whether the field is part of the record's content (everything but `rnum`).
    pub const fn is_content(self) -> bool {
        !matches!(self, AuditField::Rnum)
    }
}

/// Lower-cased column name → position, built once per result set.
#[derive(Debug, Clone)]
pub struct ColumnIndex {
    positions: HashMap<String, usize>,
    width: usize,
}

impl ColumnIndex {
    pub fn new<S: AsRef<str>>(column_names: &[S]) -> Self {
        let mut positions = HashMap::with_capacity(column_names.len());
        for (pos, name) in column_names.iter().enumerate() {
            // First occurrence wins on duplicate names (e.g. joined `a.*`).
            positions
                .entry(name.as_ref().to_ascii_lowercase())
                .or_insert(pos);
        }
        Self {
            positions,
            width: column_names.len(),
        }
    }

    /// Required columns the result set does not carry at all.
    pub fn missing_required(&self) -> Vec<&'static str> {
        AuditField::ALL
            .iter()
            .filter(|f| {
                matches!(f.kind(), FieldKind::RequiredText | FieldKind::RequiredLocalTimestamp)
            })
            .map(|f| f.column())
            .filter(|c| !self.positions.contains_key(*c))
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversion
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct PartialRecord {
    audit_type: Option<String>,
    session_id: Option<String>,
    event_timestamp: Option<NaiveDateTime>,
    texts: HashMap<AuditField, String>,
    event_timestamp_utc: Option<DateTime<Utc>>,
    return_code: Option<i64>,
    rnum: Option<i64>,
}

impl PartialRecord {
    fn set(&mut self, field: AuditField, value: &Value) -> Result<(), RecordError> {
        let column = field.column();
        match field.kind() {
            FieldKind::RequiredText => {
                let v = to_text(value);
                match field {
                    AuditField::AuditType => self.audit_type = v,
                    _ => self.session_id = v,
                }
            }
            FieldKind::Text => {
                if let Some(v) = to_text(value) {
                    self.texts.insert(field, v);
                }
            }
            FieldKind::Integer => {
                let v = to_integer(column, value)?;
                match field {
                    AuditField::ReturnCode => self.return_code = v,
                    _ => self.rnum = v,
                }
            }
            FieldKind::RequiredLocalTimestamp | FieldKind::LocalTimestamp => {
                self.event_timestamp = to_local_timestamp(column, value)?;
            }
            FieldKind::UtcTimestamp => {
                self.event_timestamp_utc = to_utc_timestamp(column, value)?;
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<AuditRecord, RecordError> {
        let audit_type = self
            .audit_type
            .ok_or(RecordError::MissingColumn(AuditField::AuditType.column()))?;
        let session_id = self
            .session_id
            .ok_or(RecordError::MissingColumn(AuditField::SessionId.column()))?;
        let event_timestamp = self
            .event_timestamp
            .ok_or(RecordError::MissingColumn(AuditField::EventTimestamp.column()))?;

        let mut record = AuditRecord::new(audit_type, session_id, event_timestamp);
        let mut take = |field: AuditField| self.texts.remove(&field);
        record.os_username = take(AuditField::OsUsername);
        record.user_host = take(AuditField::UserHost);
        record.terminal = take(AuditField::Terminal);
        record.instance_id = take(AuditField::InstanceId);
        record.db_id = take(AuditField::DbId);
        record.authentication_type = take(AuditField::AuthenticationType);
        record.db_username = take(AuditField::DbUsername);
        record.client_program_name = take(AuditField::ClientProgramName);
        record.entry_id = take(AuditField::EntryId);
        record.statement_id = take(AuditField::StatementId);
        record.action_name = take(AuditField::ActionName);
        record.os_process = take(AuditField::OsProcess);
        record.transaction_id = take(AuditField::TransactionId);
        record.scn = take(AuditField::Scn);
        record.object_schema = take(AuditField::ObjectSchema);
        record.sql_text = take(AuditField::SqlText);
        record.event_timestamp_utc = self.event_timestamp_utc;
        record.return_code = self.return_code;
        record.rnum = self.rnum;
        Ok(record)
    }
}

fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Text(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(r) => Some(r.to_string()),
        Value::Timestamp(t) => Some(t.to_string()),
        Value::TimestampUtc(t) => Some(t.to_rfc3339()),
    }
}

fn to_integer(column: &'static str, value: &Value) -> Result<Option<i64>, RecordError> {
    match value {
        Value::Null => Ok(None),
        Value::Integer(i) => Ok(Some(*i)),
        Value::Real(r) if r.fract() == 0.0 && r.abs() < i64::MAX as f64 => Ok(Some(*r as i64)),
        Value::Text(s) => s.trim().parse::<i64>().map(Some).map_err(|e| RecordError::InvalidValue {
            column,
            message: e.to_string(),
        }),
        other => Err(RecordError::InvalidValue {
            column,
            message: format!("expected integer, got {}", other.type_name()),
        }),
    }
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%:z"];

fn to_local_timestamp(
    column: &'static str,
    value: &Value,
) -> Result<Option<NaiveDateTime>, RecordError> {
    match value {
        Value::Null => Ok(None),
        Value::Timestamp(t) => Ok(Some(*t)),
        Value::TimestampUtc(t) => Ok(Some(t.naive_utc())),
        Value::Text(s) => parse_naive(s)
            .or_else(|| parse_offset(s).map(|t| t.naive_utc()))
            .map(Some)
            .ok_or_else(|| invalid_timestamp(column, s)),
        other => Err(RecordError::InvalidValue {
            column,
            message: format!("expected timestamp, got {}", other.type_name()),
        }),
    }
}

fn to_utc_timestamp(
    column: &'static str,
    value: &Value,
) -> Result<Option<DateTime<Utc>>, RecordError> {
    match value {
        Value::Null => Ok(None),
        Value::TimestampUtc(t) => Ok(Some(*t)),
        Value::Timestamp(t) => Ok(Some(t.and_utc())),
        Value::Text(s) => parse_offset(s)
            .or_else(|| parse_naive(s).map(|t| t.and_utc()))
            .map(Some)
            .ok_or_else(|| invalid_timestamp(column, s)),
        other => Err(RecordError::InvalidValue {
            column,
            message: format!("expected timestamp, got {}", other.type_name()),
        }),
    }
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn parse_offset(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .ok()
        .or_else(|| {
            OFFSET_FORMATS
                .iter()
                .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
        })
        .map(|t| t.with_timezone(&Utc))
}

fn invalid_timestamp(column: &'static str, raw: &str) -> RecordError {
    RecordError::InvalidValue {
        column,
        message: format!("unparseable timestamp {raw:?}"),
    }
}
