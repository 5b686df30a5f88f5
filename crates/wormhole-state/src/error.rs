//! Error types for wormhole-state

use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store-reported conditions that are expected to succeed when the whole
/// unit of work is replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    /// Another writer holds the lock the statement needs.
    SerializationConflict,
    /// Lock cycle between two sessions sharing a cache.
    Deadlock,
    /// The session is attached to a read-only replica.
    ReadOnlyRedirect,
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientKind::SerializationConflict => write!(f, "serialization_conflict"),
            TransientKind::Deadlock => write!(f, "deadlock"),
            TransientKind::ReadOnlyRedirect => write!(f, "read_only_redirect"),
        }
    }
}

/// Message fragments that other SQL backends use for the same conditions.
const TRANSIENT_MESSAGES: &[(&str, TransientKind)] = &[
    ("serialization failure", TransientKind::SerializationConflict),
    ("could not serialize", TransientKind::SerializationConflict),
    ("database is locked", TransientKind::SerializationConflict),
    ("deadlock detected", TransientKind::Deadlock),
    ("database table is locked", TransientKind::Deadlock),
    ("read-only transaction", TransientKind::ReadOnlyRedirect),
    ("cannot execute", TransientKind::ReadOnlyRedirect),
];

/// Classify a store error message, returning the transient kind if it is
/// one of the retryable conditions.
pub fn classify_message(message: &str) -> Option<TransientKind> {
    let lower = message.to_lowercase();
    TRANSIENT_MESSAGES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, kind)| *kind)
}

/// Errors that can occur in the state persistence layer
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization conflict, deadlock or replica redirect
    #[error("Transient store failure ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    /// Uniqueness or check constraint rejected the write
    #[error("Constraint violated: {0}")]
    Constraint(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Placeholder count does not match the parameters supplied
    #[error("Statement expects {expected} parameter(s), got {got}")]
    ParameterCount { expected: usize, got: usize },

    /// More than one statement in a single call
    #[error("Only one statement may be executed per call")]
    MultipleStatements,

    /// Transaction failed
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// The statement touches something a confined statement may not
    #[error("Statement not permitted: {0}")]
    Unauthorized(String),

    /// A write was attempted inside a read-only unit of work
    #[error("Write refused, unit of work is read-only: {0}")]
    ReadOnly(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl StateError {
    /// Returns `true` for the failures the retry coordinator may replay.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::Transient { .. })
    }

    /// The transient classification, if any.
    pub fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            StateError::Transient { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Build a transient error of the given kind.
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        StateError::Transient {
            kind,
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for StateError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ffi_err, ref detail) = err {
            let message = detail
                .clone()
                .unwrap_or_else(|| ffi_err.to_string());
            if ffi_err.code == ErrorCode::AuthorizationForStatementDenied {
                return StateError::Unauthorized(message);
            }
            let kind = match ffi_err.code {
                ErrorCode::DatabaseBusy => Some(TransientKind::SerializationConflict),
                ErrorCode::DatabaseLocked => Some(TransientKind::Deadlock),
                ErrorCode::ReadOnly => Some(TransientKind::ReadOnlyRedirect),
                _ => None,
            };
            if let Some(kind) = kind {
                return StateError::Transient { kind, message };
            }
            if ffi_err.code == ErrorCode::ConstraintViolation {
                return StateError::Constraint(message);
            }
            if let Some(kind) = classify_message(&message) {
                return StateError::Transient { kind, message };
            }
            return StateError::Query(message);
        }
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_message_matches_known_conditions() {
        assert_eq!(
            classify_message("ERROR: could not serialize access due to concurrent update"),
            Some(TransientKind::SerializationConflict)
        );
        assert_eq!(
            classify_message("deadlock detected"),
            Some(TransientKind::Deadlock)
        );
        assert_eq!(
            classify_message("cannot execute UPDATE in a read-only transaction"),
            Some(TransientKind::ReadOnlyRedirect)
        );
        assert_eq!(classify_message("no such table: users"), None);
    }

    #[test]
    fn busy_maps_to_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        let state: StateError = err.into();
        assert!(state.is_transient());
        assert_eq!(
            state.transient_kind(),
            Some(TransientKind::SerializationConflict)
        );
    }

    #[test]
    fn constraint_maps_to_constraint() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed: wormhole_functions.id".to_string()),
        );
        let state: StateError = err.into();
        assert!(matches!(state, StateError::Constraint(_)));
        assert!(!state.is_transient());
    }

    #[test]
    fn authorizer_denial_is_unauthorized_not_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_AUTH),
            Some("not authorized".to_string()),
        );
        let state: StateError = err.into();
        assert!(matches!(state, StateError::Unauthorized(_)));
        assert!(!state.is_transient());
    }

    #[test]
    fn transient_display_names_kind() {
        let err = StateError::transient(TransientKind::Deadlock, "lock cycle");
        assert!(err.to_string().contains("deadlock"));
        assert!(err.to_string().contains("lock cycle"));
    }
}
