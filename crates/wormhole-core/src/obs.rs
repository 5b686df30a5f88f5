//! Structured observability hooks for admission, invocation and retry.
//!
//! This module provides:
//! - Invocation-scoped tracing spans via the `InvocationSpan` RAII guard
//! - Emission functions for lifecycle events: admission, rejection,
//!   invocation, retry scheduling and rollback
//!
//! Events are emitted at `info!` level unless noted (filter with `RUST_LOG`).

use tracing::info;

/// RAII guard that enters an invocation-scoped span for its lifetime.
///
/// ```ignore
/// let _span = InvocationSpan::enter("total_3f2a9c01d4e5b6a7");
/// // bridge statements and nested events now carry function_id
/// ```
pub struct InvocationSpan {
    _span: tracing::span::EnteredSpan,
}

impl InvocationSpan {
    pub fn enter(function_id: &str) -> Self {
        let span = tracing::info_span!(
            "wormhole.invoke",
            function_id = %function_id,
            invocation = %uuid::Uuid::new_v4(),
        );
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: a function was admitted (`was_new = false` for cache hits).
pub fn emit_admitted(id: &str, was_new: bool, principal: &str) {
    info!(event = "function.admitted", id = %id, was_new = was_new, principal = %principal);
}

/// Emit event: admission rejected with the number of violations found.
pub fn emit_admission_rejected(name: &str, violations: usize, first: &str) {
    tracing::warn!(
        event = "function.rejected",
        name = %name,
        violations = violations,
        first = %first,
    );
}

/// Emit event: invocation finished.
pub fn emit_invoked(id: &str, duration_ms: u64, outcome: &str) {
    info!(
        event = "function.invoked",
        id = %id,
        duration_ms = duration_ms,
        outcome = %outcome,
    );
}

/// Emit event: a unit of work failed transiently and will be replayed.
pub fn emit_retry_scheduled(attempt: u32, delay_ms: u64, reason: &dyn std::fmt::Display) {
    tracing::warn!(
        event = "retry.scheduled",
        attempt = attempt,
        delay_ms = delay_ms,
        reason = %reason,
    );
}

/// Emit event: a transaction was rolled back.
pub fn emit_rolled_back(attempt: u32, reason: &dyn std::fmt::Display) {
    info!(event = "transaction.rolled_back", attempt = attempt, reason = %reason);
}

/// Emit event: rollback itself failed (warning level).
pub fn emit_rollback_error(error: &dyn std::fmt::Display) {
    tracing::warn!(event = "transaction.rollback_error", error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_span_enter() {
        let _span = InvocationSpan::enter("f_0123456789abcdef");
    }
}
