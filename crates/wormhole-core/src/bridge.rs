//! Query Bridge: the only path from sandboxed code to the data store.
//!
//! Statements are always parameterized; parameters are flat scalars bound
//! by the store's native prepared-statement interface and are never spliced
//! into statement text. They run confined: the function cache and policy
//! tables, pragmas, attached databases and transaction control are out of
//! reach.

use serde::{Deserialize, Serialize};
use tracing::debug;
use wormhole_state::{QueryOutcome, Record, Scalar, Session, StateError, StatementKind};

/// Serializable result of one bridge statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEnvelope {
    /// Rows as key-ordered records (empty for writes without RETURNING).
    pub rows: Vec<Record>,
    /// Rows returned for queries, rows affected for writes.
    pub row_count: u64,
    /// `SELECT <n>`, `INSERT <n>`, `UPDATE <n>`, `DELETE <n>` or `OK`.
    pub status: String,
}

impl From<QueryOutcome> for QueryEnvelope {
    fn from(outcome: QueryOutcome) -> Self {
        let status = match outcome.kind {
            StatementKind::Select => format!("SELECT {}", outcome.rows_affected),
            StatementKind::Insert => format!("INSERT {}", outcome.rows_affected),
            StatementKind::Update => format!("UPDATE {}", outcome.rows_affected),
            StatementKind::Delete => format!("DELETE {}", outcome.rows_affected),
            StatementKind::Other => "OK".to_string(),
        };
        Self {
            row_count: outcome.rows_affected,
            rows: outcome.rows,
            status,
        }
    }
}

impl QueryEnvelope {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "rows": self
                .rows
                .iter()
                .map(|row| row
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<serde_json::Map<_, _>>())
                .collect::<Vec<_>>(),
            "row_count": self.row_count,
            "status": self.status,
        })
    }
}

/// A bridge fault.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Rejected before the store was touched.
    #[error("{0}")]
    InvalidRequest(String),

    /// The store refused or failed the statement.
    #[error("{0}")]
    Store(String),

    /// Passed upward untouched for the retry coordinator.
    #[error(transparent)]
    Transient(StateError),
}

impl BridgeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Transient(_))
    }
}

impl From<StateError> for BridgeError {
    fn from(err: StateError) -> Self {
        if err.is_transient() {
            return BridgeError::Transient(err);
        }
        // The store's own message, without our layer's prefix.
        let message = match err {
            StateError::Connection(m)
            | StateError::Query(m)
            | StateError::Constraint(m)
            | StateError::Transaction(m) => m,
            other => other.to_string(),
        };
        BridgeError::Store(message)
    }
}

/// Convert a JSON parameter into a bridge scalar.
///
/// Arrays and objects are rejected: parameters are flat.
pub fn scalar_from_json(value: &serde_json::Value) -> Result<Scalar, BridgeError> {
    match value {
        serde_json::Value::Null => Ok(Scalar::Null),
        serde_json::Value::Bool(b) => Ok(Scalar::Bool(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Scalar::Int(i)),
            None => n.as_f64().map(Scalar::Float).ok_or_else(|| {
                BridgeError::InvalidRequest(format!("unsupported numeric parameter {n}"))
            }),
        },
        serde_json::Value::String(s) => Ok(Scalar::Text(s.clone())),
        serde_json::Value::Array(_) => Err(BridgeError::InvalidRequest(
            "query parameters must be scalars, got a list".into(),
        )),
        serde_json::Value::Object(_) => Err(BridgeError::InvalidRequest(
            "query parameters must be scalars, got a dict".into(),
        )),
    }
}

/// Executes parameterized statements on the caller's session.
///
/// Holds no state beyond the borrowed session; a new bridge is built for
/// every invocation. There is no retry here.
pub struct QueryBridge<'s> {
    session: &'s dyn Session,
}

impl<'s> QueryBridge<'s> {
    pub fn new(session: &'s dyn Session) -> Self {
        Self { session }
    }

    pub fn principal(&self) -> &str {
        self.session.principal()
    }

    pub fn run(&self, statement: &str, params: &[Scalar]) -> Result<QueryEnvelope, BridgeError> {
        if statement.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("empty statement".into()));
        }
        debug!(params = params.len(), "bridge statement");
        let outcome = self.session.execute_confined(statement, params)?;
        Ok(QueryEnvelope::from(outcome))
    }

    /// Same as [`QueryBridge::run`] with JSON parameters.
    pub fn run_json(
        &self,
        statement: &str,
        params: &[serde_json::Value],
    ) -> Result<QueryEnvelope, BridgeError> {
        let scalars = params
            .iter()
            .map(scalar_from_json)
            .collect::<Result<Vec<_>, _>>()?;
        self.run(statement, &scalars)
    }
}
