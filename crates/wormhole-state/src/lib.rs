//! Wormhole-State: SQLite Backend for Wormhole
//!
//! This crate provides the persistence layer for Wormhole. It owns every
//! byte of I/O with the data store: the session the Query Bridge and the
//! retry coordinator share, and the tables the function cache and policy
//! store live in.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: Data integrity, transactionality, and transient-failure classification.
//!
//! ## Key Components
//!
//! - `SqliteHandle`: Opens the store and hands out sessions
//! - `Session`: Native parameterized statements, transactions, savepoints
//! - `FunctionRecord` / `PolicyRecord`: Schema mapping for the two tables
//! - `StateError::is_transient`: Which failures a replay may cure

mod error;
pub mod fakes;
mod handle;
pub mod migrations;
mod schema;
pub mod session;

pub use error::{classify_message, StateError, TransientKind};
pub use handle::{SqliteHandle, SqliteSession, StoreConfig, StoreLocation};
pub use schema::{FunctionRecord, InsertOutcome, PolicyRecord};
pub use session::{
    is_reserved_table, with_savepoint, ContentDigest, DataStore, FunctionStore, PolicyStore,
    QueryOutcome, Record, Scalar, Session, StatementKind, StorageResult, RESERVED_TABLE_PREFIX,
};

/// Result type for wormhole-state operations
pub type Result<T> = std::result::Result<T, StateError>;
