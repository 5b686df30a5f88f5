//! Transaction/retry coordinator.
//!
//! Runs a unit of work inside `BEGIN ... COMMIT`. When the unit fails with a
//! transient store error the transaction is rolled back, the coordinator
//! sleeps according to the backoff policy, and the whole unit is run again.
//! Nothing inside the unit is replayed piecemeal.
//!
//! [`read_only`] runs a unit once in a transaction that refuses writes.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wormhole_state::Session;

use crate::config::RetryDefaults;
use crate::error::{WormholeError, WormholeResult};
use crate::metrics::Metrics;
use crate::obs;

/// Exponential backoff with a cap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 100,
            max_ms: 2_000,
            multiplier: 2,
        }
    }
}

impl BackoffPolicy {
    /// Delay after failed attempt `attempt` (1-based):
    /// `min(base * multiplier^(attempt - 1), max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier).saturating_pow(exponent);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.max_ms))
    }
}

/// Caller-side cancellation flag.
///
/// Cloning shares the flag. The sandbox polls it between evaluation steps
/// and the coordinator checks it around every attempt.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Retry state for one unit of work.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Replays allowed after the first attempt.
    pub max_retries: u32,
    /// Current attempt, starting at 1.
    pub attempt: u32,
    pub backoff: BackoffPolicy,
    pub cancel: CancelHandle,
}

impl RetryContext {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempt: 1,
            backoff: BackoffPolicy::default(),
            cancel: CancelHandle::new(),
        }
    }

    pub fn from_defaults(defaults: &RetryDefaults) -> Self {
        Self::new(defaults.max_retries).with_backoff(defaults.backoff.clone())
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Total attempts this context allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::from_defaults(&RetryDefaults::default())
    }
}

/// What one attempt did that decides whether it may be replayed.
#[derive(Debug)]
pub struct Attempt {
    number: u32,
    cancel: CancelHandle,
    read_only: bool,
    non_idempotent: RefCell<Vec<String>>,
}

impl Attempt {
    fn new(number: u32, cancel: CancelHandle) -> Self {
        Self {
            number,
            cancel,
            read_only: false,
            non_idempotent: RefCell::new(Vec::new()),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// Whether the attempt runs in a read-only transaction.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    /// Note an invocation made during this attempt.
    pub fn record_invocation(&self, function_id: &str, idempotent: bool) {
        if !idempotent {
            self.non_idempotent.borrow_mut().push(function_id.to_string());
        }
    }

    /// First non-idempotent function invoked in this attempt.
    pub fn first_non_idempotent(&self) -> Option<String> {
        self.non_idempotent.borrow().first().cloned()
    }

    pub fn check_cancelled(&self) -> WormholeResult<()> {
        if self.cancel.is_cancelled() {
            return Err(WormholeError::Cancelled);
        }
        Ok(())
    }
}

/// Rolls back an open transaction when dropped while still armed.
struct TransactionGuard<'s, S: Session + ?Sized> {
    session: &'s S,
    attempt: u32,
    armed: bool,
}

impl<'s, S: Session + ?Sized> TransactionGuard<'s, S> {
    fn new(session: &'s S, attempt: u32) -> Self {
        Self {
            session,
            attempt,
            armed: true,
        }
    }

    fn commit(mut self) -> WormholeResult<()> {
        self.session.commit()?;
        self.armed = false;
        Ok(())
    }

    fn rollback(mut self, reason: &dyn std::fmt::Display) {
        self.armed = false;
        self.roll_back(reason);
    }

    fn roll_back(&self, reason: &dyn std::fmt::Display) {
        if !self.session.in_transaction() {
            return;
        }
        match self.session.rollback() {
            Ok(()) => obs::emit_rolled_back(self.attempt, reason),
            Err(err) => obs::emit_rollback_error(&err),
        }
    }
}

impl<S: Session + ?Sized> Drop for TransactionGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.roll_back(&"abandoned before commit");
        }
    }
}

fn run_attempt<S, T, F>(session: &S, attempt: &Attempt, unit: &mut F) -> WormholeResult<T>
where
    S: Session + ?Sized,
    F: FnMut(&Attempt) -> WormholeResult<T>,
{
    attempt.check_cancelled()?;
    if attempt.read_only {
        session.begin_read_only()?;
    } else {
        session.begin()?;
    }
    let guard = TransactionGuard::new(session, attempt.number);

    let outcome = unit(attempt).and_then(|value| {
        attempt.check_cancelled()?;
        Ok(value)
    });
    match outcome {
        Ok(value) => {
            // A failed COMMIT can leave the transaction open; the guard
            // rolls it back on drop.
            guard.commit()?;
            Ok(value)
        }
        Err(err) => {
            guard.rollback(&err);
            Err(err)
        }
    }
}

/// Run `unit` transactionally, replaying the whole unit on transient failure.
///
/// - Non-transient errors propagate unchanged.
/// - A transient failure after the unit invoked a non-idempotent function
///   surfaces as [`WormholeError::NotRetryable`].
/// - Running out of attempts surfaces as [`WormholeError::RetriesExhausted`].
/// - A cancelled context rolls back and returns [`WormholeError::Cancelled`].
pub async fn with_retry<S, T, F>(
    session: &S,
    mut ctx: RetryContext,
    metrics: &Metrics,
    mut unit: F,
) -> WormholeResult<T>
where
    S: Session + ?Sized,
    F: FnMut(&Attempt) -> WormholeResult<T>,
{
    loop {
        let attempt = Attempt::new(ctx.attempt, ctx.cancel.clone());
        let err = match run_attempt(session, &attempt, &mut unit) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() {
            return Err(err);
        }
        if let Some(function) = attempt.first_non_idempotent() {
            return Err(WormholeError::NotRetryable {
                function,
                source: Box::new(err),
            });
        }
        if ctx.attempt >= ctx.max_attempts() {
            return Err(WormholeError::RetriesExhausted {
                attempts: ctx.attempt,
                source: Box::new(err),
            });
        }

        let delay = ctx.backoff.delay(ctx.attempt);
        obs::emit_retry_scheduled(ctx.attempt, delay.as_millis() as u64, &err);
        metrics.inc_retries();
        tokio::time::sleep(delay).await;
        ctx.attempt += 1;
    }
}

/// Run `unit` once in a read-only transaction.
///
/// Writes inside the unit fail with a non-transient storage error. The
/// transaction commits on success and rolls back on any error; nothing is
/// replayed.
pub fn read_only<S, T, F>(session: &S, cancel: CancelHandle, unit: F) -> WormholeResult<T>
where
    S: Session + ?Sized,
    F: FnOnce(&Attempt) -> WormholeResult<T>,
{
    let mut attempt = Attempt::new(1, cancel);
    attempt.read_only = true;
    let mut unit = Some(unit);
    run_attempt(session, &attempt, &mut |attempt: &Attempt| match unit.take() {
        Some(unit) => unit(attempt),
        None => Err(WormholeError::Config("read-only unit ran twice".to_string())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wormhole_state::fakes::FlakySession;
    use wormhole_state::{Scalar, SqliteHandle, TransientKind};

    fn store() -> (SqliteHandle, FlakySession<wormhole_state::SqliteSession>) {
        let handle = SqliteHandle::in_memory().unwrap();
        let session = handle.session().unwrap();
        session
            .execute("CREATE TABLE t (v INTEGER NOT NULL)", &[])
            .unwrap();
        (handle, FlakySession::new(session))
    }

    fn count(session: &impl Session) -> i64 {
        match session.execute("SELECT count(*) AS n FROM t", &[]).unwrap().rows[0]["n"] {
            Scalar::Int(n) => n,
            ref other => panic!("unexpected {other:?}"),
        }
    }

    fn fast() -> BackoffPolicy {
        BackoffPolicy {
            base_ms: 1,
            max_ms: 4,
            multiplier: 2,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(5), Duration::from_millis(1_600));
        assert_eq!(policy.delay(6), Duration::from_millis(2_000));
        assert_eq!(policy.delay(60), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn commits_on_success() {
        let (_handle, session) = store();
        let metrics = Metrics::new();
        let attempts = with_retry(&session, RetryContext::new(3), &metrics, |attempt| {
            session.execute("INSERT INTO t (v) VALUES (1)", &[])?;
            Ok(attempt.number())
        })
        .await
        .unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(count(&session), 1);
        assert!(!session.in_transaction());
        assert_eq!(metrics.retries(), 0);
    }

    #[tokio::test]
    async fn replays_whole_unit_after_transient_failure() {
        let (_handle, session) = store();
        session.fail_statement("VALUES (2)", TransientKind::SerializationConflict, 1);
        let metrics = Metrics::new();
        let ctx = RetryContext::new(3).with_backoff(fast());

        let attempts = with_retry(&session, ctx, &metrics, |attempt| {
            session.execute("INSERT INTO t (v) VALUES (1)", &[])?;
            session.execute("INSERT INTO t (v) VALUES (2)", &[])?;
            Ok(attempt.number())
        })
        .await
        .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(count(&session), 2);
        assert_eq!(metrics.retries(), 1);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let (_handle, session) = store();
        let metrics = Metrics::new();
        let mut runs = 0;
        let err = with_retry(&session, RetryContext::new(3), &metrics, |_| {
            runs += 1;
            session.execute("INSERT INTO t (v) VALUES (1)", &[])?;
            session.execute("INSERT INTO missing (v) VALUES (1)", &[])?;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, WormholeError::Storage(_)));
        assert_eq!(runs, 1);
        assert_eq!(count(&session), 0);
    }

    #[tokio::test]
    async fn exhaustion_wraps_last_error() {
        let (_handle, session) = store();
        session.fail_statement("INSERT", TransientKind::Deadlock, 10);
        let metrics = Metrics::new();
        let ctx = RetryContext::new(2).with_backoff(fast());
        let err = with_retry(&session, ctx, &metrics, |_| {
            session.execute("INSERT INTO t (v) VALUES (1)", &[])?;
            Ok(())
        })
        .await
        .unwrap_err();
        match err {
            WormholeError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(source.is_transient());
            }
            other => panic!("unexpected {other}"),
        }
        assert_eq!(metrics.retries(), 2);
        assert_eq!(count(&session), 0);
    }

    #[tokio::test]
    async fn transient_commit_failure_is_replayed() {
        let (_handle, session) = store();
        session.fail_next_commit(TransientKind::SerializationConflict);
        let metrics = Metrics::new();
        let ctx = RetryContext::new(1).with_backoff(fast());
        with_retry(&session, ctx, &metrics, |_| {
            session.execute("INSERT INTO t (v) VALUES (1)", &[])?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(count(&session), 1);
    }

    #[tokio::test]
    async fn non_idempotent_attempts_are_not_replayed() {
        let (_handle, session) = store();
        session.fail_statement("VALUES (2)", TransientKind::SerializationConflict, 1);
        let metrics = Metrics::new();
        let err = with_retry(&session, RetryContext::new(3), &metrics, |attempt| {
            attempt.record_invocation("notify_0011223344556677", false);
            session.execute("INSERT INTO t (v) VALUES (2)", &[])?;
            Ok(())
        })
        .await
        .unwrap_err();
        match err {
            WormholeError::NotRetryable { function, source } => {
                assert_eq!(function, "notify_0011223344556677");
                assert!(source.is_transient());
            }
            other => panic!("unexpected {other}"),
        }
        assert_eq!(metrics.retries(), 0);
    }

    #[tokio::test]
    async fn cancellation_rolls_back() {
        let (_handle, session) = store();
        let metrics = Metrics::new();
        let cancel = CancelHandle::new();
        let ctx = RetryContext::new(3).with_cancel(cancel.clone());
        let err = with_retry(&session, ctx, &metrics, |_| {
            session.execute("INSERT INTO t (v) VALUES (1)", &[])?;
            cancel.cancel();
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, WormholeError::Cancelled));
        assert!(!session.in_transaction());
        assert_eq!(count(&session), 0);
    }

    #[test]
    fn read_only_unit_reads_and_commits() {
        let (_handle, session) = store();
        session.execute("INSERT INTO t (v) VALUES (7)", &[]).unwrap();
        let n = read_only(&session, CancelHandle::new(), |attempt| {
            assert!(attempt.is_read_only());
            Ok(count(&session))
        })
        .unwrap();
        assert_eq!(n, 1);
        assert!(!session.in_transaction());
    }

    #[test]
    fn write_in_read_only_unit_fails_without_replay() {
        let (_handle, session) = store();
        let mut runs = 0;
        let err = read_only(&session, CancelHandle::new(), |_| {
            runs += 1;
            session.execute("INSERT INTO t (v) VALUES (1)", &[])?;
            Ok(())
        })
        .unwrap_err();
        assert!(!err.is_transient(), "{err}");
        assert!(matches!(
            err,
            WormholeError::Storage(wormhole_state::StateError::ReadOnly(_))
        ));
        assert_eq!(runs, 1);
        assert!(!session.in_transaction());

        // The restriction ends with the unit.
        session.execute("INSERT INTO t (v) VALUES (1)", &[]).unwrap();
        assert_eq!(count(&session), 1);
    }

    #[test]
    fn dropped_guard_rolls_back() {
        let (_handle, session) = store();
        session.begin().unwrap();
        {
            let _guard = TransactionGuard::new(&session, 1);
            session.execute("INSERT INTO t (v) VALUES (1)", &[]).unwrap();
        }
        assert!(!session.in_transaction());
        assert_eq!(count(&session), 0);
    }
}
