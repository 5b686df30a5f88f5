//! Error types for the wormhole core.

use serde::{Deserialize, Serialize};
use wormhole_state::{StateError, TransientKind};

use crate::validator::ValidationReport;

/// Why an invocation failed inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// The admitted source does not define a callable with the cached name.
    EntryPointMissing,
    /// The function body raised or hit a runtime fault.
    UserError,
    /// A bridge fault the body did not catch.
    BridgeError,
    /// Arguments did not match the entry point's parameters.
    InvalidArguments,
    /// Step, call-depth or deadline limit hit.
    LimitExceeded,
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionKind::EntryPointMissing => "entry_point_missing",
            ExecutionKind::UserError => "user_error",
            ExecutionKind::BridgeError => "bridge_error",
            ExecutionKind::InvalidArguments => "invalid_arguments",
            ExecutionKind::LimitExceeded => "limit_exceeded",
        };
        write!(f, "{s}")
    }
}

/// Errors surfaced by admission, invocation and the retry coordinator.
#[derive(Debug, thiserror::Error)]
pub enum WormholeError {
    #[error("syntax error: {}", .0.summary())]
    Syntax(ValidationReport),

    #[error("policy violation: {}", .0.summary())]
    PolicyViolation(ValidationReport),

    #[error("function not found: {0}")]
    NotFound(String),

    #[error("execution failed ({kind}): {message}")]
    Execution { kind: ExecutionKind, message: String },

    #[error("transient store failure ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("retries exhausted after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<WormholeError>,
    },

    #[error("not retried: non-idempotent function {function} ran in the failed attempt: {source}")]
    NotRetryable {
        function: String,
        #[source]
        source: Box<WormholeError>,
    },

    #[error("cancelled by caller")]
    Cancelled,

    #[error("permission denied: {principal} may not {action}")]
    PermissionDenied { principal: String, action: String },

    #[error("integrity check failed for {id}: stored source or syntax tree no longer matches its hash")]
    Integrity { id: String },

    #[error("storage error: {0}")]
    Storage(StateError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl WormholeError {
    pub fn execution(kind: ExecutionKind, message: impl Into<String>) -> Self {
        WormholeError::Execution {
            kind,
            message: message.into(),
        }
    }

    /// Whether replaying the unit of work may cure this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, WormholeError::Transient { .. })
    }

    /// The execution kind, for `Execution` errors.
    pub fn execution_kind(&self) -> Option<ExecutionKind> {
        match self {
            WormholeError::Execution { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The validation report carried by admission failures.
    pub fn report(&self) -> Option<&ValidationReport> {
        match self {
            WormholeError::Syntax(report) | WormholeError::PolicyViolation(report) => Some(report),
            _ => None,
        }
    }
}

impl From<StateError> for WormholeError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Transient { kind, message } => WormholeError::Transient { kind, message },
            other => WormholeError::Storage(other),
        }
    }
}

/// Result type for wormhole core operations.
pub type WormholeResult<T> = std::result::Result<T, WormholeError>;
