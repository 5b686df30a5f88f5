//! Observability tests for admission and invocation tracing.
//!
//! These exercise the structured events and spans emitted around the
//! function lifecycle: admission, rejection, invocation, retry and rollback.

use serde_json::json;
use tracing_test::traced_test;
use wormhole_core::obs::{
    emit_admission_rejected, emit_admitted, emit_invoked, emit_retry_scheduled,
    emit_rollback_error, emit_rolled_back, InvocationSpan,
};
use wormhole_core::{Metrics, PolicySet, Signature, Wormhole, WormholeConfig};
use wormhole_state::{PolicyStore, SqliteHandle};

#[traced_test]
#[test]
fn test_emit_admitted_logs_id_and_principal() {
    emit_admitted("total_0123456789abcdef", true, "alice");
    emit_admitted("total_0123456789abcdef", false, "bob");
}

#[traced_test]
#[test]
fn test_emit_admission_rejected_logs_first_violation() {
    emit_admission_rejected("leak", 2, "disallowed_capability: os (1:1)");
}

#[traced_test]
#[test]
fn test_emit_invoked_logs_outcome() {
    emit_invoked("total_0123456789abcdef", 12, "success");
}

#[traced_test]
#[test]
fn test_retry_and_rollback_events() {
    let reason = "transient store failure (deadlock): injected";
    emit_retry_scheduled(1, 100, &reason);
    emit_rolled_back(1, &reason);
    emit_rollback_error(&"cannot rollback - no transaction is active");
}

#[traced_test]
#[test]
fn test_invocation_span_enter_creates_span() {
    let span = InvocationSpan::enter("total_0123456789abcdef");
    drop(span);
}

#[traced_test]
#[test]
fn test_metrics_flush_emits_counters() {
    let metrics = Metrics::new();
    metrics.inc_validations();
    metrics.inc_admissions();
    metrics.flush();
    assert_eq!(metrics.validations(), 1);
    metrics.reset();
    assert_eq!(metrics.admissions(), 0);
}

#[traced_test]
#[test]
fn test_full_lifecycle_emits_without_panicking() {
    let handle = SqliteHandle::in_memory().unwrap();
    let session = handle.session_as("alice").unwrap();
    for policy in PolicySet::standard().iter() {
        session.put_policy(&policy.to_record("seed")).unwrap();
    }
    let wh = Wormhole::new(session, WormholeConfig::default()).unwrap();

    let installed = wh
        .install("one", "def one():\n    return 1\n", &Signature::default())
        .unwrap();
    assert_eq!(wh.invoke(&installed.id, &json!(null)).unwrap(), json!(1));
    assert!(wh
        .install("leak", "import os\n", &Signature::default())
        .is_err());
    wh.metrics().flush();
}
