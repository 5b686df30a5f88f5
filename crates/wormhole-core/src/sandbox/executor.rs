//! Runs an admitted function once, inside a fresh namespace.

use std::time::Instant;

use tracing::debug;
use wormhole_state::StateError;

use super::interp::{bind_arguments, Fatal, Flow, Interp};
use super::value::{Exception, Value};
use crate::bridge::QueryBridge;
use crate::cache::CachedFunction;
use crate::config::SandboxConfig;
use crate::error::ExecutionKind;
use crate::retry::CancelHandle;

/// Outcome of one sandboxed call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Success(serde_json::Value),
    Failure {
        kind: ExecutionKind,
        message: String,
    },
    Cancelled,
}

impl ExecutionResult {
    fn failure(kind: ExecutionKind, message: impl Into<String>) -> Self {
        ExecutionResult::Failure {
            kind,
            message: message.into(),
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionResult::Success(_) => "success",
            ExecutionResult::Failure { .. } => "failure",
            ExecutionResult::Cancelled => "cancelled",
        }
    }
}

/// Executes cached functions with the configured limits.
///
/// Nothing survives between calls: each execution gets its own namespace,
/// and the only way out is the bridge handed in by the caller.
#[derive(Debug, Clone)]
pub struct Executor {
    config: SandboxConfig,
    bridge_binding: String,
}

impl Executor {
    pub fn new(config: SandboxConfig, bridge_binding: impl Into<String>) -> Self {
        Self {
            config,
            bridge_binding: bridge_binding.into(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `cached` with `args`.
    ///
    /// `args` is a JSON array (positional) or object (named); `null` means no
    /// arguments. Transient store faults are returned as `Err` so the retry
    /// coordinator sees them; everything else is an [`ExecutionResult`].
    pub fn execute(
        &self,
        cached: &CachedFunction,
        args: &serde_json::Value,
        bridge: &QueryBridge<'_>,
        cancel: Option<&CancelHandle>,
    ) -> Result<ExecutionResult, StateError> {
        let started = Instant::now();
        let mut interp = Interp::new(&self.config, bridge, &self.bridge_binding, cancel);
        let outcome = run(&mut interp, cached, args);
        let steps = interp.steps();
        drop(interp);

        debug!(
            function = %cached.id,
            steps,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sandbox run finished"
        );
        match outcome {
            Ok(result) => Ok(result),
            Err(Fatal::Limit(message)) => Ok(ExecutionResult::failure(
                ExecutionKind::LimitExceeded,
                message,
            )),
            Err(Fatal::Cancelled) => Ok(ExecutionResult::Cancelled),
            Err(Fatal::Store(err)) => Err(err),
        }
    }
}

fn run<'p>(
    interp: &mut Interp<'_, 'p>,
    cached: &'p CachedFunction,
    args: &serde_json::Value,
) -> Result<ExecutionResult, Fatal> {
    if let Err(flow) = interp.run_module(&cached.program.body) {
        return raised(flow);
    }

    let Some(Value::Function(entry)) = interp.global(&cached.name) else {
        return Ok(ExecutionResult::failure(
            ExecutionKind::EntryPointMissing,
            format!("source does not define a function named '{}'", cached.name),
        ));
    };

    let (positional, named) = match arguments(args) {
        Ok(parts) => parts,
        Err(message) => {
            return Ok(ExecutionResult::failure(
                ExecutionKind::InvalidArguments,
                message,
            ))
        }
    };
    let frame = match bind_arguments(&entry, positional, named) {
        Ok(frame) => frame,
        Err(exc) => {
            return Ok(ExecutionResult::failure(
                ExecutionKind::InvalidArguments,
                exc.message,
            ))
        }
    };

    match interp.call_bound(&entry, frame) {
        Ok(value) => Ok(match value.to_json() {
            Ok(json) => ExecutionResult::Success(json),
            Err(exc) => ExecutionResult::failure(
                ExecutionKind::UserError,
                format!("result is not serializable: {}", exc.message),
            ),
        }),
        Err(flow) => raised(flow),
    }
}

type Arguments<'p> = (Vec<Value<'p>>, Vec<(String, Value<'p>)>);

fn arguments<'p>(args: &serde_json::Value) -> Result<Arguments<'p>, String> {
    match args {
        serde_json::Value::Null => Ok((Vec::new(), Vec::new())),
        serde_json::Value::Array(items) => {
            Ok((items.iter().map(Value::from_json).collect(), Vec::new()))
        }
        serde_json::Value::Object(map) => Ok((
            Vec::new(),
            map.iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v)))
                .collect(),
        )),
        other => Err(format!(
            "arguments must be a JSON array or object, got {}",
            json_type(other)
        )),
    }
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn raised(flow: Flow) -> Result<ExecutionResult, Fatal> {
    match flow {
        Flow::Raise(exc) => Ok(uncaught(&exc)),
        Flow::Fatal(fatal) => Err(fatal),
    }
}

fn uncaught(exc: &Exception) -> ExecutionResult {
    let kind = if exc.class == "BridgeError" {
        ExecutionKind::BridgeError
    } else {
        ExecutionKind::UserError
    };
    ExecutionResult::failure(kind, exc.to_string())
}
