//! SQLite Handle - Connection and Operations
//!
//! Manages the store location and hands out sessions. Each session owns its
//! own connection, so each has its own transaction:
//! - native parameterized statements for the Query Bridge
//! - BEGIN / COMMIT / ROLLBACK and savepoints for the retry coordinator
//! - an authorizer that fences sandboxed statements off the core's tables
//! - the function cache and policy tables
//!
//! Supports both on-disk files and named in-memory stores (shared cache, so
//! every session of one handle sees the same data).

use std::cell::Cell;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, ToSql};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::error::{StateError, TransientKind};
use crate::migrations::init_schema;
use crate::schema::{FunctionRecord, InsertOutcome, PolicyRecord};
use crate::session::{
    is_reserved_table, with_savepoint, FunctionStore, PolicyStore, QueryOutcome, Record, Scalar, Session,
    StatementKind, StorageResult,
};
use crate::Result;

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Named in-memory store, alive while its handle is.
    Memory(String),
    /// SQLite database file.
    File(PathBuf),
}

/// Configuration for opening a store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub location: StoreLocation,
    /// How long a session waits on a locked database before reporting busy
    pub busy_timeout_ms: u64,
    /// Principal recorded on rows written through sessions
    pub principal: String,
}

impl StoreConfig {
    /// Fresh, uniquely named in-memory store.
    pub fn in_memory() -> Self {
        Self {
            location: StoreLocation::Memory(format!("wormhole-{}", uuid::Uuid::new_v4())),
            busy_timeout_ms: 5_000,
            principal: "wormhole".to_string(),
        }
    }

    /// On-disk store at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::File(path.into()),
            ..Self::in_memory()
        }
    }

    /// Set the principal
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    /// Set the busy timeout
    pub fn with_busy_timeout_ms(mut self, ms: u64) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - WORMHOLE_DB (optional; a file path, or `:memory:` / unset for in-memory)
    /// - WORMHOLE_BUSY_TIMEOUT_MS (optional, default: 5000)
    /// - WORMHOLE_PRINCIPAL (optional, default: "wormhole")
    pub fn from_env() -> std::result::Result<Self, String> {
        let mut config = match std::env::var("WORMHOLE_DB") {
            Ok(path) if !path.is_empty() && path != ":memory:" => Self::file(path),
            _ => Self::in_memory(),
        };
        if let Ok(raw) = std::env::var("WORMHOLE_BUSY_TIMEOUT_MS") {
            config.busy_timeout_ms = raw
                .parse()
                .map_err(|_| format!("WORMHOLE_BUSY_TIMEOUT_MS is not a number: {raw}"))?;
        }
        if let Ok(principal) = std::env::var("WORMHOLE_PRINCIPAL") {
            if !principal.is_empty() {
                config.principal = principal;
            }
        }
        Ok(config)
    }
}

/// SQLite store handle for Wormhole
///
/// Cloning is cheap; all clones address the same store.
#[derive(Clone)]
pub struct SqliteHandle {
    target: String,
    flags: OpenFlags,
    busy_timeout: Duration,
    principal: String,
    // Keeps a named in-memory database alive between sessions.
    _keepalive: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteHandle")
            .field("target", &self.target)
            .field("principal", &self.principal)
            .finish()
    }
}

impl SqliteHandle {
    /// Open the store described by `config` and apply migrations.
    #[instrument(skip(config), fields(location = ?config.location))]
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let (target, flags) = match &config.location {
            StoreLocation::Memory(name) => (
                format!("file:{name}?mode=memory&cache=shared"),
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
            StoreLocation::File(path) => (
                path.to_string_lossy().into_owned(),
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
        };
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

        let conn = connect(&target, flags, busy_timeout)?;
        init_schema(&conn)?;
        info!(target = %target, "Opened Wormhole store");

        Ok(Self {
            target,
            flags,
            busy_timeout,
            principal: config.principal.clone(),
            _keepalive: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a fresh in-memory store (tests, demos).
    pub fn in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory())
    }

    /// Default principal from the configuration.
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Open a session acting for the configured principal.
    pub fn session(&self) -> Result<SqliteSession> {
        self.session_as(self.principal.clone())
    }

    /// Open a session acting for `principal`.
    pub fn session_as(&self, principal: impl Into<String>) -> Result<SqliteSession> {
        let conn = connect(&self.target, self.flags, self.busy_timeout)?;
        let principal = principal.into();
        debug!(principal = %principal, "Opened session");
        Ok(SqliteSession {
            conn,
            principal,
            read_only: Cell::new(false),
        })
    }
}

fn connect(target: &str, flags: OpenFlags, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open_with_flags(target, flags)
        .map_err(|e| StateError::Connection(format!("{target}: {e}")))?;
    conn.busy_timeout(busy_timeout)
        .map_err(|e| StateError::Connection(e.to_string()))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|e| StateError::Connection(e.to_string()))?;
    Ok(conn)
}

/// One authenticated session with its own connection and transaction.
pub struct SqliteSession {
    conn: Connection,
    principal: String,
    // Set while a read-only transaction holds `PRAGMA query_only`.
    read_only: Cell<bool>,
}

type Authorizer = fn(AuthContext<'_>) -> Authorization;

/// Authorizer installed for the duration of a confined statement.
fn confine(ctx: AuthContext<'_>) -> Authorization {
    match ctx.action {
        AuthAction::Read { table_name, .. }
        | AuthAction::Insert { table_name, .. }
        | AuthAction::Update { table_name, .. }
        | AuthAction::Delete { table_name, .. }
        | AuthAction::CreateTable { table_name, .. }
        | AuthAction::CreateTempTable { table_name, .. }
        | AuthAction::DropTable { table_name, .. }
        | AuthAction::AlterTable { table_name, .. }
        | AuthAction::CreateIndex { table_name, .. }
        | AuthAction::DropIndex { table_name, .. }
        | AuthAction::CreateTrigger { table_name, .. }
        | AuthAction::CreateTempTrigger { table_name, .. }
        | AuthAction::DropTrigger { table_name, .. }
        | AuthAction::Analyze { table_name, .. }
            if is_reserved_table(table_name) =>
        {
            Authorization::Deny
        }
        AuthAction::Pragma { .. }
        | AuthAction::Attach { .. }
        | AuthAction::Detach { .. }
        | AuthAction::Transaction { .. }
        | AuthAction::Savepoint { .. } => Authorization::Deny,
        _ => Authorization::Allow,
    }
}

impl std::fmt::Debug for SqliteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSession")
            .field("principal", &self.principal)
            .field("in_transaction", &!self.conn.is_autocommit())
            .field("read_only", &self.read_only.get())
            .finish()
    }
}

impl ToSql for Scalar {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Scalar::Null => ToSqlOutput::Owned(Value::Null),
            Scalar::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            Scalar::Int(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            Scalar::Float(f) => ToSqlOutput::Owned(Value::Real(*f)),
            Scalar::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn scalar_from_ref(value: ValueRef<'_>) -> Scalar {
    match value {
        ValueRef::Null => Scalar::Null,
        ValueRef::Integer(i) => Scalar::Int(i),
        ValueRef::Real(f) => Scalar::Float(f),
        ValueRef::Text(bytes) => Scalar::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Scalar::Text(hex::encode(bytes)),
    }
}

/// Whether `sql` holds more than one statement. Semicolons inside quotes,
/// bracketed identifiers and comments do not count; trailing semicolons,
/// whitespace and comments after the first statement are allowed.
pub(crate) fn has_multiple_statements(sql: &str) -> bool {
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    let mut ended = false;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
                continue;
            }
            ';' => ended = true,
            c if c.is_whitespace() => {}
            _ if ended => return true,
            '\'' | '"' | '`' | '[' => {
                let close = if c == '[' { ']' } else { c };
                i += 1;
                while i < chars.len() && chars[i] != close {
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StateError::Deserialization(format!("timestamp {raw}: {e}")))
}

/// Column order shared by every function-row query.
const FUNCTION_COLUMNS: &str = "id, name, source, signature, program, source_hash, program_hash, \
                                created_by, created_at, last_executed, execution_count, idempotent";

/// Row exactly as SQLite returns it, before JSON and timestamp decoding.
struct RawFunctionRow {
    id: String,
    name: String,
    source: String,
    signature: String,
    program: String,
    source_hash: String,
    program_hash: String,
    created_by: String,
    created_at: String,
    last_executed: Option<String>,
    execution_count: i64,
    idempotent: bool,
}

impl RawFunctionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            source: row.get(2)?,
            signature: row.get(3)?,
            program: row.get(4)?,
            source_hash: row.get(5)?,
            program_hash: row.get(6)?,
            created_by: row.get(7)?,
            created_at: row.get(8)?,
            last_executed: row.get(9)?,
            execution_count: row.get(10)?,
            idempotent: row.get(11)?,
        })
    }
}

/// Cached syntax trees nest deeper than serde_json's default limit allows.
fn decode_json(text: &str) -> serde_json::Result<serde_json::Value> {
    let mut de = serde_json::Deserializer::from_str(text);
    de.disable_recursion_limit();
    let value = serde_json::Value::deserialize(&mut de)?;
    de.end()?;
    Ok(value)
}

impl TryFrom<RawFunctionRow> for FunctionRecord {
    type Error = StateError;

    fn try_from(raw: RawFunctionRow) -> StorageResult<Self> {
        let decode = |field: &str, text: &str| {
            decode_json(text)
                .map_err(|e| StateError::Deserialization(format!("{field} of {}: {e}", raw.id)))
        };
        Ok(FunctionRecord {
            signature: decode("signature", &raw.signature)?,
            program: decode("program", &raw.program)?,
            created_at: parse_ts(&raw.created_at)?,
            last_executed: raw.last_executed.as_deref().map(parse_ts).transpose()?,
            execution_count: u64::try_from(raw.execution_count).map_err(|_| {
                StateError::Deserialization(format!(
                    "negative execution_count for {}",
                    raw.id
                ))
            })?,
            idempotent: raw.idempotent,
            id: raw.id,
            name: raw.name,
            source: raw.source,
            source_hash: raw.source_hash,
            program_hash: raw.program_hash,
            created_by: raw.created_by,
        })
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

impl SqliteSession {
    fn checked_savepoint_name<'a>(&self, name: &'a str) -> StorageResult<&'a str> {
        if is_identifier(name) {
            Ok(name)
        } else {
            Err(StateError::Transaction(format!(
                "invalid savepoint name: {name}"
            )))
        }
    }

    fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Scalar]) -> StorageResult<()> {
        let expected = stmt.parameter_count();
        if expected != params.len() {
            return Err(StateError::ParameterCount {
                expected,
                got: params.len(),
            });
        }
        for (offset, param) in params.iter().enumerate() {
            let number = offset + 1;
            let index = stmt
                .parameter_index(&format!("${number}"))?
                .unwrap_or(number);
            stmt.raw_bind_parameter(index, param)?;
        }
        Ok(())
    }
}

impl SqliteSession {
    /// Whether a read-only transaction is open.
    pub fn is_read_only(&self) -> bool {
        self.read_only.get()
    }

    /// Inside a read-only unit a write is the caller's mistake, not a
    /// replica redirect a replay could cure.
    fn refine(&self, err: StateError) -> StateError {
        match err {
            StateError::Transient {
                kind: TransientKind::ReadOnlyRedirect,
                message,
            } if self.read_only.get() => StateError::ReadOnly(message),
            other => other,
        }
    }

    fn end_read_only(&self) -> StorageResult<()> {
        if self.read_only.replace(false) {
            self.conn.pragma_update(None, "query_only", false)?;
        }
        Ok(())
    }

    fn run(&self, statement: &str, params: &[Scalar]) -> StorageResult<QueryOutcome> {
        if has_multiple_statements(statement) {
            return Err(StateError::MultipleStatements);
        }
        let kind = StatementKind::of(statement);
        let mut stmt = self.conn.prepare(statement)?;
        Self::bind_params(&mut stmt, params)?;

        if stmt.column_count() == 0 {
            let changed = stmt.raw_execute()?;
            debug!(changed, "statement executed");
            return Ok(QueryOutcome::empty(kind, changed as u64));
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut records = Vec::new();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (i, column) in columns.iter().enumerate() {
                record.insert(column.clone(), scalar_from_ref(row.get_ref(i)?));
            }
            records.push(record);
        }
        drop(rows);

        let rows_affected = match kind {
            StatementKind::Select | StatementKind::Other => records.len() as u64,
            _ => self.conn.changes() as u64,
        };
        debug!(rows = records.len(), "query executed");
        Ok(QueryOutcome {
            kind,
            columns,
            rows: records,
            rows_affected,
        })
    }
}

impl Session for SqliteSession {
    fn principal(&self) -> &str {
        &self.principal
    }

    #[instrument(skip(self, params), fields(params = params.len()))]
    fn execute(&self, statement: &str, params: &[Scalar]) -> StorageResult<QueryOutcome> {
        self.run(statement, params).map_err(|err| self.refine(err))
    }

    #[instrument(skip(self, params), fields(params = params.len()))]
    fn execute_confined(
        &self,
        statement: &str,
        params: &[Scalar],
    ) -> StorageResult<QueryOutcome> {
        self.conn.authorizer(Some(confine as Authorizer));
        let outcome = self.run(statement, params);
        self.conn.authorizer(None::<Authorizer>);
        outcome.map_err(|err| self.refine(err))
    }

    fn begin(&self) -> StorageResult<()> {
        if !self.conn.is_autocommit() {
            return Err(StateError::Transaction(
                "a transaction is already open".to_string(),
            ));
        }
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn begin_read_only(&self) -> StorageResult<()> {
        self.begin()?;
        if let Err(err) = self.conn.pragma_update(None, "query_only", true) {
            self.conn.execute_batch("ROLLBACK")?;
            return Err(err.into());
        }
        self.read_only.set(true);
        Ok(())
    }

    fn commit(&self) -> StorageResult<()> {
        if self.conn.is_autocommit() {
            return Err(StateError::Transaction("no open transaction".to_string()));
        }
        self.conn.execute_batch("COMMIT")?;
        self.end_read_only()
    }

    fn rollback(&self) -> StorageResult<()> {
        if self.conn.is_autocommit() {
            return self.end_read_only();
        }
        self.conn.execute_batch("ROLLBACK")?;
        self.end_read_only()
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn savepoint(&self, name: &str) -> StorageResult<()> {
        let name = self.checked_savepoint_name(name)?;
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        Ok(())
    }

    fn release_savepoint(&self, name: &str) -> StorageResult<()> {
        let name = self.checked_savepoint_name(name)?;
        self.conn.execute_batch(&format!("RELEASE SAVEPOINT {name}"))?;
        Ok(())
    }

    fn rollback_to_savepoint(&self, name: &str) -> StorageResult<()> {
        let name = self.checked_savepoint_name(name)?;
        self.conn.execute_batch(&format!(
            "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"
        ))?;
        Ok(())
    }
}

impl FunctionStore for SqliteSession {
    #[instrument(skip(self))]
    fn get_function(&self, id: &str) -> StorageResult<Option<FunctionRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {FUNCTION_COLUMNS} FROM wormhole_functions WHERE id = ?1"),
                params![id],
                RawFunctionRow::from_row,
            )
            .optional()?;
        raw.map(FunctionRecord::try_from).transpose()
    }

    #[instrument(skip(self, record), fields(id = %record.id))]
    fn insert_function(&self, record: &FunctionRecord) -> StorageResult<InsertOutcome> {
        let signature = serde_json::to_string(&record.signature)?;
        let program = serde_json::to_string(&record.program)?;
        let execution_count = i64::try_from(record.execution_count)
            .map_err(|_| StateError::Serialization("execution_count overflow".to_string()))?;

        let result = self.conn.execute(
            &format!(
                "INSERT INTO wormhole_functions ({FUNCTION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                record.id,
                record.name,
                record.source,
                signature,
                program,
                record.source_hash,
                record.program_hash,
                record.created_by,
                ts(&record.created_at),
                record.last_executed.as_ref().map(ts),
                execution_count,
                record.idempotent,
            ],
        );

        match result {
            Ok(_) => {
                debug!("function row inserted");
                Ok(InsertOutcome::Inserted)
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                debug!("function row already present");
                Ok(InsertOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    fn record_execution(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<FunctionRecord>> {
        with_savepoint(self, "wormhole_bookkeeping", || {
            let changed = self.conn.execute(
                "UPDATE wormhole_functions \
                 SET execution_count = execution_count + 1, last_executed = ?2 \
                 WHERE id = ?1",
                params![id, ts(&at)],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            self.get_function(id)
        })
    }

    fn list_functions(&self) -> StorageResult<Vec<FunctionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FUNCTION_COLUMNS} FROM wormhole_functions ORDER BY name, created_at"
        ))?;
        let raws = stmt
            .query_map([], RawFunctionRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(FunctionRecord::try_from).collect()
    }

    #[instrument(skip(self))]
    fn delete_function(&self, id: &str) -> StorageResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM wormhole_functions WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

impl PolicyStore for SqliteSession {
    fn load_policy(&self) -> StorageResult<Vec<PolicyRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, allowed, note, updated_by, updated_at FROM wormhole_policy ORDER BY name",
        )?;
        let raws = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raws.into_iter()
            .map(|(name, allowed, note, updated_by, updated_at)| {
                Ok(PolicyRecord {
                    name,
                    allowed,
                    note,
                    updated_by,
                    updated_at: parse_ts(&updated_at)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, record), fields(name = %record.name, allowed = record.allowed))]
    fn put_policy(&self, record: &PolicyRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO wormhole_policy (name, allowed, note, updated_by, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(name) DO UPDATE SET \
               allowed = excluded.allowed, note = excluded.note, \
               updated_by = excluded.updated_by, updated_at = excluded.updated_at",
            params![
                record.name,
                record.allowed,
                record.note,
                record.updated_by,
                ts(&record.updated_at),
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn remove_policy(&self, name: &str) -> StorageResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM wormhole_policy WHERE name = ?1", params![name])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ContentDigest;

    fn session() -> (SqliteHandle, SqliteSession) {
        let handle = SqliteHandle::in_memory().unwrap();
        let session = handle.session().unwrap();
        session
            .execute(
                "CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT, balance REAL)",
                &[],
            )
            .unwrap();
        (handle, session)
    }

    fn function_record(name: &str, source: &str) -> FunctionRecord {
        let digest = ContentDigest::from_bytes(source.as_bytes());
        let program = serde_json::json!({"body": [{"float": 0.1}, {"int": 7}]});
        FunctionRecord {
            id: format!("{name}_{}", digest.prefix(16)),
            name: name.to_string(),
            source: source.to_string(),
            signature: serde_json::json!({"params": ["x"]}),
            program_hash: FunctionRecord::program_digest(&program).to_string(),
            program,
            source_hash: digest.as_str().to_string(),
            created_by: "tester".to_string(),
            created_at: Utc::now(),
            last_executed: None,
            execution_count: 0,
            idempotent: true,
        }
    }

    #[test]
    fn multiple_statement_scanner() {
        assert!(!has_multiple_statements("SELECT 1"));
        assert!(!has_multiple_statements("SELECT 1;  "));
        assert!(!has_multiple_statements("SELECT ';' AS semi; -- trailing"));
        assert!(!has_multiple_statements("SELECT 1; /* done */"));
        assert!(has_multiple_statements("SELECT 1; DROP TABLE accounts"));
        assert!(has_multiple_statements("SELECT 1;;SELECT 2"));
    }

    #[test]
    fn execute_binds_numbered_placeholders() {
        let (_handle, session) = session();
        let out = session
            .execute(
                "INSERT INTO accounts (owner, balance) VALUES ($2, $1)",
                &[Scalar::Float(10.5), Scalar::Text("ada".into())],
            )
            .unwrap();
        assert_eq!(out.kind, StatementKind::Insert);
        assert_eq!(out.rows_affected, 1);

        let out = session
            .execute(
                "SELECT owner, balance FROM accounts WHERE owner = ?1",
                &[Scalar::Text("ada".into())],
            )
            .unwrap();
        assert_eq!(out.rows_affected, 1);
        assert_eq!(out.columns, vec!["owner", "balance"]);
        assert_eq!(out.rows[0]["owner"], Scalar::Text("ada".into()));
        assert_eq!(out.rows[0]["balance"], Scalar::Float(10.5));
    }

    #[test]
    fn execute_rejects_parameter_mismatch_and_multiple_statements() {
        let (_handle, session) = session();
        let err = session
            .execute("SELECT * FROM accounts WHERE id = $1", &[])
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::ParameterCount {
                expected: 1,
                got: 0
            }
        ));

        let err = session
            .execute("SELECT 1; DELETE FROM accounts", &[])
            .unwrap_err();
        assert!(matches!(err, StateError::MultipleStatements));
    }

    #[test]
    fn rollback_discards_writes() {
        let (_handle, session) = session();
        session.begin().unwrap();
        assert!(session.in_transaction());
        session
            .execute(
                "INSERT INTO accounts (owner, balance) VALUES ($1, $2)",
                &[Scalar::Text("bob".into()), Scalar::Int(3)],
            )
            .unwrap();
        session.rollback().unwrap();
        assert!(!session.in_transaction());

        let out = session.execute("SELECT COUNT(*) AS n FROM accounts", &[]).unwrap();
        assert_eq!(out.rows[0]["n"], Scalar::Int(0));
    }

    #[test]
    fn sessions_share_in_memory_store() {
        let (handle, session) = session();
        session
            .execute(
                "INSERT INTO accounts (owner, balance) VALUES ('eve', 1)",
                &[],
            )
            .unwrap();
        let other = handle.session_as("auditor").unwrap();
        assert_eq!(other.principal(), "auditor");
        let out = other.execute("SELECT owner FROM accounts", &[]).unwrap();
        assert_eq!(out.rows.len(), 1);
    }

    #[test]
    fn insert_function_reports_existing_id() {
        let (_handle, session) = session();
        let record = function_record("add", "def add(x):\n    return x + 1\n");
        assert_eq!(
            session.insert_function(&record).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            session.insert_function(&record).unwrap(),
            InsertOutcome::AlreadyExists
        );
        let stored = session.get_function(&record.id).unwrap().unwrap();
        assert_eq!(stored.source, record.source);
        assert_eq!(stored.signature, record.signature);
        assert!(stored.is_intact());
    }

    #[test]
    fn record_execution_increments_once_per_call() {
        let (_handle, session) = session();
        let record = function_record("add", "def add(x):\n    return x + 1\n");
        session.insert_function(&record).unwrap();

        for expected in 1..=3u64 {
            let updated = session
                .record_execution(&record.id, Utc::now())
                .unwrap()
                .unwrap();
            assert_eq!(updated.execution_count, expected);
            assert!(updated.last_executed.is_some());
        }
        assert!(session
            .record_execution("missing_0000", Utc::now())
            .unwrap()
            .is_none());
        assert_eq!(
            session
                .get_function(&record.id)
                .unwrap()
                .unwrap()
                .execution_count,
            3
        );
    }

    #[test]
    fn policy_upsert_and_remove() {
        let (_handle, session) = session();
        session
            .put_policy(&PolicyRecord::new("os", false, "host access", "admin"))
            .unwrap();
        session
            .put_policy(&PolicyRecord::new("math", true, "numeric", "admin"))
            .unwrap();
        session
            .put_policy(&PolicyRecord::new("os", true, "temporarily allowed", "admin"))
            .unwrap();

        let rows = session.load_policy().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "math");
        assert!(rows[1].allowed);
        assert_eq!(rows[1].note, "temporarily allowed");

        assert!(session.remove_policy("os").unwrap());
        assert!(!session.remove_policy("os").unwrap());
    }

    #[test]
    fn savepoint_names_are_checked() {
        let (_handle, session) = session();
        assert!(session.savepoint("x; DROP TABLE accounts").is_err());
        session.savepoint("sp_1").unwrap();
        session.rollback_to_savepoint("sp_1").unwrap();
    }

    #[test]
    fn file_store_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::file(dir.path().join("wormhole.db"));
        {
            let handle = SqliteHandle::open(&config).unwrap();
            let session = handle.session().unwrap();
            session
                .put_policy(&PolicyRecord::new("json", true, "encoding", "admin"))
                .unwrap();
        }
        let handle = SqliteHandle::open(&config).unwrap();
        let rows = handle.session().unwrap().load_policy().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "json");
    }
}
