//! Fault-injecting session wrapper (testing only)
//!
//! `FlakySession` wraps any real store and forwards every call, except that
//! it can be told to fail matching statements (or commits) with a transient
//! error a fixed number of times. It also keeps a log of every statement it
//! forwarded so tests can see what was replayed.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::{StateError, TransientKind};
use crate::schema::{FunctionRecord, InsertOutcome, PolicyRecord};
use crate::session::*;

#[derive(Debug)]
struct StatementFault {
    needle: String,
    kind: TransientKind,
    remaining: usize,
}

#[derive(Debug, Default)]
struct FaultState {
    statements: Vec<StatementFault>,
    commits: Vec<TransientKind>,
    log: Vec<String>,
    injected: usize,
}

/// Session wrapper that injects transient faults.
#[derive(Debug)]
pub struct FlakySession<S> {
    inner: S,
    state: Mutex<FaultState>,
}

impl<S> FlakySession<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: Mutex::new(FaultState::default()),
        }
    }

    /// Fail the next `times` statements whose text contains `needle`.
    pub fn fail_statement(&self, needle: impl Into<String>, kind: TransientKind, times: usize) {
        self.with_state(|state| {
            state.statements.push(StatementFault {
                needle: needle.into(),
                kind,
                remaining: times,
            })
        });
    }

    /// Fail the next commit with `kind`.
    pub fn fail_next_commit(&self, kind: TransientKind) {
        self.with_state(|state| state.commits.push(kind));
    }

    /// Every statement forwarded to the inner session, in order.
    pub fn executed(&self) -> Vec<String> {
        self.with_state(|state| state.log.clone())
    }

    /// Number of faults injected so far.
    pub fn injected(&self) -> usize {
        self.with_state(|state| state.injected)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FaultState) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn before_statement(&self, statement: &str) -> StorageResult<()> {
        if let Some(err) = self.take_statement_fault(statement) {
            return Err(err);
        }
        self.with_state(|state| state.log.push(statement.to_string()));
        Ok(())
    }

    fn take_statement_fault(&self, statement: &str) -> Option<StateError> {
        self.with_state(|state| {
            let fault = state
                .statements
                .iter_mut()
                .find(|f| f.remaining > 0 && statement.contains(&f.needle))?;
            fault.remaining -= 1;
            let err = StateError::transient(
                fault.kind,
                format!("injected {} on: {}", fault.kind, fault.needle),
            );
            state.injected += 1;
            Some(err)
        })
    }
}

impl<S: Session> Session for FlakySession<S> {
    fn principal(&self) -> &str {
        self.inner.principal()
    }

    fn execute(&self, statement: &str, params: &[Scalar]) -> StorageResult<QueryOutcome> {
        self.before_statement(statement)?;
        self.inner.execute(statement, params)
    }

    fn execute_confined(
        &self,
        statement: &str,
        params: &[Scalar],
    ) -> StorageResult<QueryOutcome> {
        self.before_statement(statement)?;
        self.inner.execute_confined(statement, params)
    }

    fn begin(&self) -> StorageResult<()> {
        self.inner.begin()
    }

    fn begin_read_only(&self) -> StorageResult<()> {
        self.inner.begin_read_only()
    }

    fn commit(&self) -> StorageResult<()> {
        let fault = self.with_state(|state| {
            if state.commits.is_empty() {
                None
            } else {
                state.injected += 1;
                Some(state.commits.remove(0))
            }
        });
        if let Some(kind) = fault {
            return Err(StateError::transient(kind, "injected commit failure"));
        }
        self.inner.commit()
    }

    fn rollback(&self) -> StorageResult<()> {
        self.inner.rollback()
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    fn savepoint(&self, name: &str) -> StorageResult<()> {
        self.inner.savepoint(name)
    }

    fn release_savepoint(&self, name: &str) -> StorageResult<()> {
        self.inner.release_savepoint(name)
    }

    fn rollback_to_savepoint(&self, name: &str) -> StorageResult<()> {
        self.inner.rollback_to_savepoint(name)
    }
}

impl<S: FunctionStore> FunctionStore for FlakySession<S> {
    fn get_function(&self, id: &str) -> StorageResult<Option<FunctionRecord>> {
        self.inner.get_function(id)
    }

    fn insert_function(&self, record: &FunctionRecord) -> StorageResult<InsertOutcome> {
        self.inner.insert_function(record)
    }

    fn record_execution(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<FunctionRecord>> {
        self.inner.record_execution(id, at)
    }

    fn list_functions(&self) -> StorageResult<Vec<FunctionRecord>> {
        self.inner.list_functions()
    }

    fn delete_function(&self, id: &str) -> StorageResult<bool> {
        self.inner.delete_function(id)
    }
}

impl<S: PolicyStore> PolicyStore for FlakySession<S> {
    fn load_policy(&self) -> StorageResult<Vec<PolicyRecord>> {
        self.inner.load_policy()
    }

    fn put_policy(&self, record: &PolicyRecord) -> StorageResult<()> {
        self.inner.put_policy(record)
    }

    fn remove_policy(&self, name: &str) -> StorageResult<bool> {
        self.inner.remove_policy(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::SqliteHandle;

    #[test]
    fn injects_only_the_requested_number_of_faults() {
        let handle = SqliteHandle::in_memory().unwrap();
        let session = FlakySession::new(handle.session().unwrap());
        session
            .execute("CREATE TABLE t (v INTEGER)", &[])
            .unwrap();
        session.fail_statement("INSERT INTO t", TransientKind::Deadlock, 1);

        let err = session
            .execute("INSERT INTO t (v) VALUES (1)", &[])
            .unwrap_err();
        assert_eq!(err.transient_kind(), Some(TransientKind::Deadlock));
        session
            .execute("INSERT INTO t (v) VALUES (1)", &[])
            .unwrap();

        assert_eq!(session.injected(), 1);
        assert_eq!(
            session.executed(),
            vec!["CREATE TABLE t (v INTEGER)", "INSERT INTO t (v) VALUES (1)"]
        );
    }

    #[test]
    fn commit_fault_leaves_transaction_open() {
        let handle = SqliteHandle::in_memory().unwrap();
        let session = FlakySession::new(handle.session().unwrap());
        session.fail_next_commit(TransientKind::SerializationConflict);

        session.begin().unwrap();
        assert!(session.commit().unwrap_err().is_transient());
        assert!(session.in_transaction());
        session.rollback().unwrap();
        assert!(!session.in_transaction());
    }
}
