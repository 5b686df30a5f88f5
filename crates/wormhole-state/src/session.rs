//! Storage trait definitions for Wormhole
//!
//! These traits define the seams between the core and the data store:
//! - `Session`: an established, authenticated session with transactions and
//!   a native parameterized query interface
//! - `FunctionStore`: the function cache table
//! - `PolicyStore`: the capability allow-list table
//!
//! The traits are synchronous: the sandbox calls the store from inside a
//! running function body, one statement at a time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StateError;
use crate::schema::{FunctionRecord, InsertOutcome, PolicyRecord};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StateError>;

// ---------------------------------------------------------------------------
// Values crossing the store boundary
// ---------------------------------------------------------------------------

/// A single, already-serialized scalar: the only thing a statement
/// parameter or a result column may hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Convert to a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Null => serde_json::Value::Null,
            Scalar::Bool(b) => serde_json::Value::Bool(*b),
            Scalar::Int(i) => serde_json::Value::from(*i),
            Scalar::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Scalar::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Null => write!(f, "NULL"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Text(s) => write!(f, "'{s}'"),
        }
    }
}

/// One result row, keyed by column name in key order.
pub type Record = BTreeMap<String, Scalar>;

/// What kind of statement produced a [`QueryOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl StatementKind {
    /// Classify a statement by its leading keyword.
    pub fn of(statement: &str) -> Self {
        let head = statement
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        match head.as_str() {
            "SELECT" | "WITH" | "VALUES" => StatementKind::Select,
            "INSERT" | "REPLACE" => StatementKind::Insert,
            "UPDATE" => StatementKind::Update,
            "DELETE" => StatementKind::Delete,
            _ => StatementKind::Other,
        }
    }
}

/// Raw outcome of one statement executed through a [`Session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutcome {
    /// Statement classification
    pub kind: StatementKind,
    /// Column names in select-list order (empty for writes)
    pub columns: Vec<String>,
    /// Materialized rows
    pub rows: Vec<Record>,
    /// Rows changed by a write, or rows returned by a query
    pub rows_affected: u64,
}

impl QueryOutcome {
    /// Outcome of a statement that returns no rows.
    pub fn empty(kind: StatementKind, rows_affected: u64) -> Self {
        Self {
            kind,
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected,
        }
    }
}

// ---------------------------------------------------------------------------
// Content digest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading `len` hex chars.
    pub fn prefix(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StateError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StateError::Deserialization(format!("invalid digest: {s}")));
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Tables owned by the core. Confined statements may not touch them.
pub const RESERVED_TABLE_PREFIX: &str = "wormhole_";

/// Whether `table` is one of the core's own tables (case-insensitive).
pub fn is_reserved_table(table: &str) -> bool {
    table
        .get(..RESERVED_TABLE_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(RESERVED_TABLE_PREFIX))
}

/// An established data-store session.
///
/// Authentication, pooling and connection lifecycle belong to whoever
/// created the session; the core only uses it.
///
/// Guarantees:
/// - `execute` runs exactly one parameterized statement; parameters are never
///   spliced into the statement text.
/// - `begin`/`commit`/`rollback` bracket one transaction; nesting is done with
///   savepoints.
/// - `execute_confined` refuses statements that read or write the tables
///   whose names start with [`RESERVED_TABLE_PREFIX`], attach databases,
///   change pragmas, or open and close transactions or savepoints.
/// - After `begin_read_only`, every write fails with
///   [`StateError::ReadOnly`] until the transaction ends.
pub trait Session {
    /// The authenticated principal this session acts for.
    fn principal(&self) -> &str;

    /// Execute one statement with positional parameters.
    fn execute(&self, statement: &str, params: &[Scalar]) -> StorageResult<QueryOutcome>;

    /// Execute one statement on behalf of sandboxed code.
    fn execute_confined(&self, statement: &str, params: &[Scalar])
        -> StorageResult<QueryOutcome>;

    /// Open a transaction.
    fn begin(&self) -> StorageResult<()>;

    /// Open a transaction in which every write is refused.
    fn begin_read_only(&self) -> StorageResult<()>;

    /// Commit the open transaction.
    fn commit(&self) -> StorageResult<()>;

    /// Roll back the open transaction. No-op when none is open.
    fn rollback(&self) -> StorageResult<()>;

    /// Whether a transaction is currently open.
    fn in_transaction(&self) -> bool;

    /// Create a named savepoint.
    fn savepoint(&self, name: &str) -> StorageResult<()>;

    /// Release (keep) a named savepoint.
    fn release_savepoint(&self, name: &str) -> StorageResult<()>;

    /// Undo everything since a named savepoint and release it.
    fn rollback_to_savepoint(&self, name: &str) -> StorageResult<()>;
}

/// Run `f` inside a savepoint: released on success, rolled back on error.
pub fn with_savepoint<S, T, E, F>(session: &S, name: &str, f: F) -> std::result::Result<T, E>
where
    S: Session + ?Sized,
    E: From<StateError>,
    F: FnOnce() -> std::result::Result<T, E>,
{
    session.savepoint(name)?;
    match f() {
        Ok(value) => {
            session.release_savepoint(name)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = session.rollback_to_savepoint(name) {
                tracing::warn!(savepoint = %name, error = %rollback_err, "savepoint rollback failed");
            }
            Err(err)
        }
    }
}

// ---------------------------------------------------------------------------
// FunctionStore: the function cache table
// ---------------------------------------------------------------------------

/// Content-addressed function cache rows.
///
/// Guarantees:
/// - Rows are only ever inserted, never rewritten; only `last_executed` and
///   `execution_count` change after insertion.
/// - `insert_function` on an existing id reports `AlreadyExists` instead of
///   failing (the losing side of an admission race).
/// - `record_execution` updates bookkeeping and reads the row back as one
///   atomic step.
pub trait FunctionStore {
    /// Fetch a row without touching bookkeeping.
    fn get_function(&self, id: &str) -> StorageResult<Option<FunctionRecord>>;

    /// Insert a newly admitted row.
    fn insert_function(&self, record: &FunctionRecord) -> StorageResult<InsertOutcome>;

    /// Increment `execution_count`, set `last_executed`, and return the row.
    fn record_execution(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<FunctionRecord>>;

    /// All rows, ordered by name then creation time.
    fn list_functions(&self) -> StorageResult<Vec<FunctionRecord>>;

    /// Administrative delete. Returns whether a row was removed.
    fn delete_function(&self, id: &str) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// PolicyStore: the capability allow-list
// ---------------------------------------------------------------------------

/// Capability allow-list rows keyed by capability name.
pub trait PolicyStore {
    /// All policy rows, ordered by name.
    fn load_policy(&self) -> StorageResult<Vec<PolicyRecord>>;

    /// Insert or replace one row.
    fn put_policy(&self, record: &PolicyRecord) -> StorageResult<()>;

    /// Remove one row. Returns whether a row was removed.
    fn remove_policy(&self, name: &str) -> StorageResult<bool>;
}

/// Everything the core needs from a store.
pub trait DataStore: Session + FunctionStore + PolicyStore {}

impl<T> DataStore for T where T: Session + FunctionStore + PolicyStore {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_kind_by_leading_keyword() {
        assert_eq!(StatementKind::of("  select 1"), StatementKind::Select);
        assert_eq!(
            StatementKind::of("WITH x AS (SELECT 1) SELECT * FROM x"),
            StatementKind::Select
        );
        assert_eq!(
            StatementKind::of("insert into t values (1)"),
            StatementKind::Insert
        );
        assert_eq!(StatementKind::of("UPDATE t SET a = 1"), StatementKind::Update);
        assert_eq!(StatementKind::of("DELETE FROM t"), StatementKind::Delete);
        assert_eq!(StatementKind::of("CREATE TABLE t (a)"), StatementKind::Other);
    }

    #[test]
    fn reserved_tables_by_prefix() {
        assert!(is_reserved_table("wormhole_policy"));
        assert!(is_reserved_table("WORMHOLE_functions"));
        assert!(!is_reserved_table("accounts"));
        assert!(!is_reserved_table("worm"));
        assert!(!is_reserved_table("wörmhole_x"));
    }

    #[test]
    fn digest_prefix_and_validation() {
        let digest = ContentDigest::from_bytes(b"def f():\n    return 1\n");
        assert_eq!(digest.as_str().len(), 64);
        assert_eq!(digest.prefix(16).len(), 16);
        assert!(digest.as_str().starts_with(digest.prefix(16)));

        assert!(ContentDigest::try_from("xyz".to_string()).is_err());
        let upper = digest.as_str().to_ascii_uppercase();
        assert_eq!(ContentDigest::try_from(upper).unwrap(), digest);
    }

    #[test]
    fn scalar_to_json() {
        assert_eq!(Scalar::Int(3).to_json(), serde_json::json!(3));
        assert_eq!(Scalar::Text("a".into()).to_json(), serde_json::json!("a"));
        assert_eq!(Scalar::Float(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(Scalar::Null.to_json(), serde_json::Value::Null);
    }
}
