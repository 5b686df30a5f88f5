//! Wormhole Core Library
//!
//! Moves computation to the data: functions are statically validated against
//! a capability policy, cached under a content-derived id, and executed in a
//! sandbox whose only way out is a parameterized query bridge bound to the
//! caller's session.
//!
//! ## Key Components
//!
//! - `Validator`: single-walk static admission checks
//! - `FunctionCache`: content-addressed admission and lookup
//! - `Executor`: sandboxed execution with step, depth and time limits
//! - `QueryBridge`: the one capability injected into the sandbox
//! - `with_retry`: transaction/retry coordinator
//! - `Wormhole`: the facade tying them to one session

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod lang;
pub mod metrics;
pub mod obs;
pub mod policy;
pub mod retry;
pub mod sandbox;
pub mod service;
pub mod telemetry;
pub mod validator;

pub use bridge::{BridgeError, QueryBridge, QueryEnvelope};
pub use cache::{function_id, Admission, CachedFunction, FunctionCache, Signature};
pub use config::{RetryDefaults, SandboxConfig, WormholeConfig, DEFAULT_BRIDGE_BINDING};
pub use error::{ExecutionKind, WormholeError, WormholeResult};
pub use metrics::Metrics;
pub use policy::{CapabilityPolicy, PolicySet};
pub use retry::{with_retry, Attempt, BackoffPolicy, CancelHandle, RetryContext};
pub use sandbox::{ExecutionResult, Executor};
pub use service::{Installed, Transaction, Wormhole};
pub use validator::{validate, ValidationReport, Validator, Violation, ViolationKind};
