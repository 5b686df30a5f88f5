//! End-to-end admission and invocation scenarios against an in-memory store.

use serde_json::json;
use wormhole_core::{
    function_id, BackoffPolicy, CancelHandle, CapabilityPolicy, ExecutionKind, PolicySet,
    RetryContext, Signature, ViolationKind, Wormhole, WormholeConfig, WormholeError,
};
use wormhole_state::fakes::FlakySession;
use wormhole_state::{PolicyStore, Scalar, Session, SqliteHandle, SqliteSession, TransientKind};

const ADMIN: &str = "admin";

const SUM: &str = "\
import math

def total(values):
    return math.fsum(values) + sum([1, 2, 3])
";

const TRANSFER: &str = r#"def transfer(amount):
    query("INSERT INTO ledger (entry, amount) VALUES ('debit', $1)", [-amount])
    query("INSERT INTO ledger (entry, amount) VALUES ('credit', $1)", [amount])
    return amount
"#;

fn seeded_handle(policy: &PolicySet) -> SqliteHandle {
    let handle = SqliteHandle::in_memory().unwrap();
    let admin = handle.session_as(ADMIN).unwrap();
    for entry in policy.iter() {
        admin.put_policy(&entry.to_record(ADMIN)).unwrap();
    }
    admin
        .execute(
            "CREATE TABLE ledger (id INTEGER PRIMARY KEY, entry TEXT NOT NULL, amount INTEGER NOT NULL)",
            &[],
        )
        .unwrap();
    handle
}

fn config() -> WormholeConfig {
    WormholeConfig::default().with_admin(ADMIN)
}

fn wormhole(principal: &str) -> (SqliteHandle, Wormhole<SqliteSession>) {
    let handle = seeded_handle(&PolicySet::standard());
    let session = handle.session_as(principal).unwrap();
    (handle, Wormhole::new(session, config()).unwrap())
}

fn flaky_wormhole() -> (SqliteHandle, Wormhole<FlakySession<SqliteSession>>) {
    let handle = seeded_handle(&PolicySet::standard());
    let session = FlakySession::new(handle.session_as("alice").unwrap());
    (handle, Wormhole::new(session, config()).unwrap())
}

fn fast_retry(max_retries: u32) -> RetryContext {
    RetryContext::new(max_retries).with_backoff(BackoffPolicy {
        base_ms: 1,
        max_ms: 5,
        multiplier: 2,
    })
}

fn ledger(session: &impl Session) -> Vec<(String, i64)> {
    session
        .execute("SELECT entry, amount FROM ledger ORDER BY id", &[])
        .unwrap()
        .rows
        .into_iter()
        .map(|row| match (&row["entry"], &row["amount"]) {
            (Scalar::Text(entry), Scalar::Int(amount)) => (entry.clone(), *amount),
            other => panic!("unexpected row {other:?}"),
        })
        .collect()
}

#[test]
fn scenario_a_allowed_capability_installs_and_runs() {
    let policy = PolicySet::empty()
        .with(CapabilityPolicy::allow("math", "numeric helpers"))
        .with(CapabilityPolicy::deny("os", "host access"));
    let handle = seeded_handle(&policy);
    let wh = Wormhole::new(handle.session_as("alice").unwrap(), config()).unwrap();

    let installed = wh
        .install("total", SUM, &Signature::new(["values"]))
        .unwrap();
    assert_eq!(installed.id, function_id("total", SUM));
    assert!(!installed.cached);

    let result = wh.invoke(&installed.id, &json!([[1.5, 2.5]])).unwrap();
    assert_eq!(result, json!(10.0));
}

#[test]
fn scenario_b_denied_capability_is_named() {
    let (_handle, wh) = wormhole("alice");
    let source = "import os\n\ndef leak():\n    return os.getcwd()\n";

    let err = wh.install("leak", source, &Signature::default()).unwrap_err();
    assert!(matches!(err, WormholeError::PolicyViolation(_)));
    let report = err.report().unwrap();
    assert!(!report.accepted);
    assert!(report.has(ViolationKind::DisallowedCapability, "os"));

    assert!(matches!(
        wh.peek(&function_id("leak", source)),
        Err(WormholeError::NotFound(_))
    ));
}

#[test]
fn scenario_c_direct_host_access_is_rejected() {
    let (_handle, wh) = wormhole("alice");
    let source = "def raw():\n    return plpy.execute('SELECT 1')\n";

    let err = wh.install("raw", source, &Signature::default()).unwrap_err();
    let report = err.report().unwrap();
    assert!(report
        .violations
        .iter()
        .any(|v| v.kind == ViolationKind::DirectHostAccess));
    assert!(wh.list().unwrap().is_empty());
}

#[tokio::test]
async fn scenario_d_transient_failure_replays_the_whole_unit() {
    let (_handle, wh) = flaky_wormhole();
    let installed = wh
        .install("transfer", TRANSFER, &Signature::new(["amount"]))
        .unwrap();
    wh.session()
        .fail_statement("'credit'", TransientKind::SerializationConflict, 1);

    let attempts = wh
        .with_retry(fast_retry(3), |tx| {
            assert_eq!(tx.invoke(&installed.id, &json!([25]))?, json!(25));
            Ok(tx.attempt())
        })
        .await
        .unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(wh.session().injected(), 1);
    let debits = wh
        .session()
        .executed()
        .iter()
        .filter(|s| s.contains("'debit'"))
        .count();
    assert_eq!(debits, 2);
    assert_eq!(
        ledger(wh.session()),
        vec![("debit".to_string(), -25), ("credit".to_string(), 25)]
    );
    assert_eq!(wh.peek(&installed.id).unwrap().execution_count, 1);
    assert_eq!(wh.metrics().retries(), 1);
}

#[test]
fn scenario_e_unknown_id_leaves_other_entries_alone() {
    let (_handle, wh) = wormhole("alice");
    let installed = wh
        .install("total", SUM, &Signature::new(["values"]))
        .unwrap();
    wh.invoke(&installed.id, &json!([[1]])).unwrap();
    let before = wh.peek(&installed.id).unwrap();

    let err = wh
        .invoke("total_ffffffffffffffff", &json!(null))
        .unwrap_err();
    assert!(matches!(err, WormholeError::NotFound(ref id) if id == "total_ffffffffffffffff"));

    let after = wh.peek(&installed.id).unwrap();
    assert_eq!(after.execution_count, before.execution_count);
    assert_eq!(after.last_executed, before.last_executed);
}

#[test]
fn resubmission_is_cached_without_revalidation() {
    let (_handle, wh) = wormhole("alice");
    let first = wh.install("total", SUM, &Signature::default()).unwrap();
    let validations = wh.metrics().validations();

    for _ in 0..3 {
        let again = wh.install("total", SUM, &Signature::default()).unwrap();
        assert_eq!(again.id, first.id);
        assert!(again.cached);
    }
    assert_eq!(wh.metrics().validations(), validations);
    assert_eq!(wh.metrics().cache_hits(), 3);
    assert_eq!(wh.list().unwrap().len(), 1);
}

#[test]
fn unknown_capability_is_denied() {
    let (_handle, wh) = wormhole("alice");
    let source = "import numpy\n\ndef f():\n    return 1\n";
    let err = wh.install("f", source, &Signature::default()).unwrap_err();
    assert!(err
        .report()
        .unwrap()
        .has(ViolationKind::DisallowedCapability, "numpy"));
    assert!(wh.list().unwrap().is_empty());
}

#[test]
fn forbidden_operations_reject_despite_allowed_imports() {
    let (_handle, wh) = wormhole("alice");
    let sources = [
        ("run", "import math\n\ndef run(code):\n    return eval(code)\n", "eval"),
        ("peek", "import json\n\ndef peek():\n    return globals()\n", "globals"),
        ("fetch", "import re\n\ndef fetch(o, n):\n    return getattr(o, n)\n", "getattr"),
    ];
    for (name, source, detail) in sources {
        let err = wh.install(name, source, &Signature::default()).unwrap_err();
        assert!(
            err.report()
                .unwrap()
                .has(ViolationKind::ForbiddenOperation, detail),
            "{name}: {err}"
        );
    }
    assert!(wh.list().unwrap().is_empty());
}

#[test]
fn peeking_never_counts_and_each_invoke_counts_once() {
    let (_handle, wh) = wormhole("alice");
    let installed = wh
        .install("total", SUM, &Signature::new(["values"]))
        .unwrap();

    for _ in 0..5 {
        assert_eq!(wh.peek(&installed.id).unwrap().execution_count, 0);
    }
    for expected in 1..=3 {
        wh.invoke(&installed.id, &json!([[]])).unwrap();
        assert_eq!(wh.peek(&installed.id).unwrap().execution_count, expected);
    }
    assert!(wh.peek(&installed.id).unwrap().last_executed.is_some());
}

#[test]
fn execution_failures_carry_their_kind() {
    let (_handle, wh) = wormhole("alice");

    let misnamed = wh
        .install("entry", "def other():\n    return 1\n", &Signature::default())
        .unwrap();
    let err = wh.invoke(&misnamed.id, &json!(null)).unwrap_err();
    assert_eq!(err.execution_kind(), Some(ExecutionKind::EntryPointMissing));

    let pair = wh
        .install("pair", "def pair(a, b):\n    return [a, b]\n", &Signature::default())
        .unwrap();
    let err = wh.invoke(&pair.id, &json!([1, 2, 3])).unwrap_err();
    assert_eq!(err.execution_kind(), Some(ExecutionKind::InvalidArguments));

    let boom = wh
        .install(
            "boom",
            "def boom():\n    raise RuntimeError('no')\n",
            &Signature::default(),
        )
        .unwrap();
    match wh.invoke(&boom.id, &json!(null)).unwrap_err() {
        WormholeError::Execution { kind, message } => {
            assert_eq!(kind, ExecutionKind::UserError);
            assert!(message.contains("no"));
        }
        other => panic!("unexpected {other}"),
    }

    let bad_query = wh
        .install(
            "bad",
            "def bad():\n    return query('SELECT * FROM nowhere')\n",
            &Signature::default(),
        )
        .unwrap();
    let err = wh.invoke(&bad_query.id, &json!(null)).unwrap_err();
    assert_eq!(err.execution_kind(), Some(ExecutionKind::BridgeError));
}

#[test]
fn runaway_functions_hit_the_step_limit() {
    let handle = seeded_handle(&PolicySet::standard());
    let mut config = config();
    config.sandbox.max_steps = 10_000;
    let wh = Wormhole::new(handle.session_as("alice").unwrap(), config).unwrap();

    let spin = wh
        .install(
            "spin",
            "def spin():\n    n = 0\n    while True:\n        n += 1\n",
            &Signature::default(),
        )
        .unwrap();
    let err = wh.invoke(&spin.id, &json!(null)).unwrap_err();
    assert_eq!(err.execution_kind(), Some(ExecutionKind::LimitExceeded));
}

#[tokio::test]
async fn non_idempotent_units_are_not_replayed() {
    let (_handle, wh) = flaky_wormhole();
    let installed = wh
        .install(
            "transfer",
            TRANSFER,
            &Signature::new(["amount"]).non_idempotent(),
        )
        .unwrap();
    wh.session()
        .fail_statement("'credit'", TransientKind::Deadlock, 1);

    let mut runs = 0;
    let err = wh
        .with_retry(fast_retry(3), |tx| {
            runs += 1;
            tx.invoke(&installed.id, &json!([5]))
        })
        .await
        .unwrap_err();

    match err {
        WormholeError::NotRetryable { function, source } => {
            assert_eq!(function, installed.id);
            assert!(source.is_transient());
        }
        other => panic!("unexpected {other}"),
    }
    assert_eq!(runs, 1);
    assert!(ledger(wh.session()).is_empty());
    assert_eq!(wh.peek(&installed.id).unwrap().execution_count, 0);
}

#[tokio::test]
async fn exhausted_retries_roll_everything_back() {
    let (_handle, wh) = flaky_wormhole();
    let installed = wh
        .install("transfer", TRANSFER, &Signature::new(["amount"]))
        .unwrap();
    wh.session()
        .fail_statement("'credit'", TransientKind::ReadOnlyRedirect, 10);

    let err = wh
        .with_retry(fast_retry(2), |tx| tx.invoke(&installed.id, &json!([5])))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WormholeError::RetriesExhausted { attempts: 3, .. }
    ));
    assert!(ledger(wh.session()).is_empty());
    assert_eq!(wh.peek(&installed.id).unwrap().execution_count, 0);
}

#[tokio::test]
async fn cancellation_discards_the_attempt() {
    let (_handle, wh) = wormhole("alice");
    let installed = wh
        .install("transfer", TRANSFER, &Signature::new(["amount"]))
        .unwrap();
    let cancel = CancelHandle::new();

    let err = wh
        .with_retry(fast_retry(3).with_cancel(cancel.clone()), |tx| {
            tx.invoke(&installed.id, &json!([7]))?;
            cancel.cancel();
            tx.invoke(&installed.id, &json!([7]))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, WormholeError::Cancelled));
    assert!(ledger(wh.session()).is_empty());
    assert_eq!(wh.peek(&installed.id).unwrap().execution_count, 0);
    assert!(!wh.session().in_transaction());
}

#[test]
fn policy_changes_apply_to_later_admissions() {
    let handle = seeded_handle(&PolicySet::standard());
    let admin = Wormhole::new(handle.session_as(ADMIN).unwrap(), config()).unwrap();
    let alice = Wormhole::new(handle.session_as("alice").unwrap(), config()).unwrap();

    let source = "import json\n\ndef encode(v):\n    return json.dumps(v)\n";
    assert!(alice.check(source).unwrap().accepted);

    admin
        .policy_set(&CapabilityPolicy::deny("json", "frozen"))
        .unwrap();
    let err = alice
        .install("encode", source, &Signature::default())
        .unwrap_err();
    assert!(err
        .report()
        .unwrap()
        .has(ViolationKind::DisallowedCapability, "json"));

    assert!(matches!(
        alice.policy_set(&CapabilityPolicy::allow("json", "mine")),
        Err(WormholeError::PermissionDenied { .. })
    ));
}
