//! Sandboxed execution of admitted functions.
//!
//! # Modules
//!
//! - [`value`]: runtime values and exception classes
//! - [`interp`]: the tree-walking evaluator with step, depth and time limits
//! - [`modules`]: the capability modules (`math`, `json`, `re`, `datetime`)
//! - [`executor`]: one call of a cached function, mapped to an [`ExecutionResult`]

mod builtins;
pub mod executor;
pub mod interp;
pub mod modules;
pub mod value;

pub use crate::config::SandboxConfig;
pub use executor::{ExecutionResult, Executor};
