//! SQLite schema migrations and initialization
//!
//! Creates the Wormhole tables with their constraints. Safe to call on every
//! connection (idempotent); the applied version is tracked in
//! `PRAGMA user_version`.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StateError;
use crate::Result;

/// Current schema version.
///
/// - 1: `wormhole_functions`, `wormhole_policy`
/// - 2: `wormhole_functions.program_hash`
pub const SCHEMA_VERSION: i64 = 2;

/// Initialize all Wormhole tables.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;

    if version >= SCHEMA_VERSION {
        debug!(version, "schema already current");
        return Ok(());
    }

    info!(from = version, to = SCHEMA_VERSION, "Initializing Wormhole schema");
    if version < 1 {
        init_functions_table(conn)?;
        init_policy_table(conn)?;
    } else {
        add_program_hash_column(conn)?;
    }
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    info!("Wormhole schema initialization complete");
    Ok(())
}

/// Initialize `wormhole_functions`
///
/// Schema:
/// ```text
/// TABLE wormhole_functions {
///   id:              TEXT (primary key)
///   name:            TEXT (indexed)
///   source:          TEXT
///   signature:       TEXT (JSON)
///   program:         TEXT (JSON syntax tree)
///   source_hash:     TEXT
///   program_hash:    TEXT
///   created_by:      TEXT
///   created_at:      TEXT (RFC 3339)
///   last_executed:   TEXT? (RFC 3339)
///   execution_count: INTEGER >= 0
///   idempotent:      INTEGER (0 | 1)
/// }
/// ```
///
/// Constraints:
/// - `id` is unique; a duplicate insert is the losing side of an admission race
/// - `execution_count` never goes negative
fn init_functions_table(conn: &Connection) -> Result<()> {
    debug!("Initializing wormhole_functions table");
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS wormhole_functions (
    id              TEXT PRIMARY KEY NOT NULL,
    name            TEXT NOT NULL,
    source          TEXT NOT NULL,
    signature       TEXT NOT NULL,
    program         TEXT NOT NULL,
    source_hash     TEXT NOT NULL,
    program_hash    TEXT NOT NULL,
    created_by      TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    last_executed   TEXT,
    execution_count INTEGER NOT NULL DEFAULT 0 CHECK (execution_count >= 0),
    idempotent      INTEGER NOT NULL DEFAULT 1 CHECK (idempotent IN (0, 1))
);
CREATE INDEX IF NOT EXISTS idx_wormhole_functions_name ON wormhole_functions (name);
"#,
    )
    .map_err(|e| StateError::SchemaSetup(format!("wormhole_functions: {e}")))?;
    Ok(())
}

/// Version 1 to 2: rows cached before the column existed get an empty
/// `program_hash`, which never verifies; they must be removed and admitted
/// again.
fn add_program_hash_column(conn: &Connection) -> Result<()> {
    debug!("Adding wormhole_functions.program_hash");
    conn.execute_batch(
        "ALTER TABLE wormhole_functions ADD COLUMN program_hash TEXT NOT NULL DEFAULT '';",
    )
    .map_err(|e| StateError::SchemaSetup(format!("wormhole_functions.program_hash: {e}")))?;
    Ok(())
}

/// Initialize `wormhole_policy`
///
/// Schema:
/// ```text
/// TABLE wormhole_policy {
///   name:       TEXT (primary key)
///   allowed:    INTEGER (0 | 1)
///   note:       TEXT
///   updated_by: TEXT
///   updated_at: TEXT (RFC 3339)
/// }
/// ```
fn init_policy_table(conn: &Connection) -> Result<()> {
    debug!("Initializing wormhole_policy table");
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS wormhole_policy (
    name       TEXT PRIMARY KEY NOT NULL,
    allowed    INTEGER NOT NULL CHECK (allowed IN (0, 1)),
    note       TEXT NOT NULL DEFAULT '',
    updated_by TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#,
    )
    .map_err(|e| StateError::SchemaSetup(format!("wormhole_policy: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'wormhole_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn version_one_store_gains_program_hash() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE wormhole_functions (id TEXT PRIMARY KEY, name TEXT, source TEXT, \
             signature TEXT, program TEXT, source_hash TEXT, created_by TEXT, created_at TEXT, \
             last_executed TEXT, execution_count INTEGER NOT NULL DEFAULT 0, \
             idempotent INTEGER NOT NULL DEFAULT 1); \
             CREATE TABLE wormhole_policy (name TEXT PRIMARY KEY, allowed INTEGER, note TEXT, \
             updated_by TEXT, updated_at TEXT); \
             INSERT INTO wormhole_functions (id, name, source, signature, program, source_hash, created_by, created_at) \
             VALUES ('f_0', 'f', '', '{}', '[]', '', 't', '2024-01-01T00:00:00Z'); \
             PRAGMA user_version = 1;",
        )
        .unwrap();

        init_schema(&conn).unwrap();
        let hash: String = conn
            .query_row(
                "SELECT program_hash FROM wormhole_functions WHERE id = 'f_0'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hash, "");
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn negative_execution_count_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let err = conn
            .execute(
                "INSERT INTO wormhole_functions (id, name, source, signature, program, source_hash, program_hash, created_by, created_at, execution_count) \
                 VALUES ('f_0', 'f', '', '{}', '[]', '', '', 't', '2024-01-01T00:00:00Z', -1)",
                [],
            )
            .unwrap_err();
        assert!(matches!(StateError::from(err), StateError::Constraint(_)));
    }
}
