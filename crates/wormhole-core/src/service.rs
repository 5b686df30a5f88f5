//! The `Wormhole` facade: install, invoke and check functions over one
//! established session.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::instrument;
use wormhole_state::DataStore;

use crate::bridge::{BridgeError, QueryBridge};
use crate::cache::{CachedFunction, FunctionCache, Signature};
use crate::config::WormholeConfig;
use crate::error::{ExecutionKind, WormholeError, WormholeResult};
use crate::metrics::Metrics;
use crate::obs;
use crate::policy::{CapabilityPolicy, PolicySet};
use crate::retry::{self, Attempt, CancelHandle, RetryContext};
use crate::sandbox::{ExecutionResult, Executor};
use crate::validator::{ValidationReport, Validator};

/// Result of [`Wormhole::install`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installed {
    pub id: String,
    /// `true` when the source was already cached and validation was skipped.
    pub cached: bool,
}

/// Function admission and execution bound to one session.
///
/// Every operation runs as the session's principal. Policy writes and
/// cache removal require that principal to be listed in
/// [`WormholeConfig::admin_principals`].
pub struct Wormhole<S: DataStore> {
    session: S,
    config: WormholeConfig,
    metrics: Arc<Metrics>,
    executor: Executor,
}

impl<S: DataStore> std::fmt::Debug for Wormhole<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wormhole")
            .field("principal", &self.session.principal())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: DataStore> Wormhole<S> {
    pub fn new(session: S, config: WormholeConfig) -> WormholeResult<Self> {
        config.validate()?;
        let executor = Executor::new(config.sandbox.clone(), config.bridge_binding.clone());
        Ok(Self {
            session,
            config,
            metrics: Arc::new(Metrics::new()),
            executor,
        })
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn config(&self) -> &WormholeConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    fn cache(&self) -> FunctionCache<'_, S> {
        FunctionCache::new(&self.session, &self.metrics, &self.config.bridge_binding)
    }

    fn require_admin(&self, action: &str) -> WormholeResult<()> {
        let principal = self.session.principal();
        if self.config.is_admin(principal) {
            return Ok(());
        }
        Err(WormholeError::PermissionDenied {
            principal: principal.to_string(),
            action: action.to_string(),
        })
    }

    /// Validate and cache `source` under its content-derived id.
    pub fn install(
        &self,
        name: &str,
        source: &str,
        signature: &Signature,
    ) -> WormholeResult<Installed> {
        let admission = self.cache().admit(name, source, signature)?;
        Ok(Installed {
            id: admission.id,
            cached: !admission.was_new,
        })
    }

    /// Run a cached function with JSON arguments and return its JSON result.
    pub fn invoke(&self, id: &str, args: &serde_json::Value) -> WormholeResult<serde_json::Value> {
        self.invoke_in(id, args, None)
    }

    #[instrument(skip(self, args, attempt), fields(principal = %self.session.principal()))]
    fn invoke_in(
        &self,
        id: &str,
        args: &serde_json::Value,
        attempt: Option<&Attempt>,
    ) -> WormholeResult<serde_json::Value> {
        let _span = obs::InvocationSpan::enter(id);
        let started = Instant::now();

        // A read-only unit cannot write bookkeeping.
        let cached = match attempt {
            Some(attempt) if attempt.is_read_only() => self.cache().peek(id)?,
            _ => self.cache().lookup(id)?,
        };
        if let Some(attempt) = attempt {
            attempt.record_invocation(&cached.id, cached.idempotent);
        }
        self.metrics.inc_invocations();

        let bridge = QueryBridge::new(&self.session);
        let cancel = attempt.map(Attempt::cancel_handle);
        let outcome = self.executor.execute(&cached, args, &bridge, cancel);

        let label = match &outcome {
            Ok(result) => result.label(),
            Err(_) => "store_error",
        };
        obs::emit_invoked(id, started.elapsed().as_millis() as u64, label);

        match outcome? {
            ExecutionResult::Success(value) => Ok(value),
            ExecutionResult::Failure { kind, message } => {
                Err(WormholeError::execution(kind, message))
            }
            ExecutionResult::Cancelled => Err(WormholeError::Cancelled),
        }
    }

    /// Validate `source` against the stored policy without caching it.
    pub fn check(&self, source: &str) -> WormholeResult<ValidationReport> {
        let policy = self.cache().policy()?;
        self.metrics.inc_validations();
        Ok(Validator::new(&policy, &self.config.bridge_binding).validate(source))
    }

    /// A cached entry, without touching its bookkeeping.
    pub fn peek(&self, id: &str) -> WormholeResult<CachedFunction> {
        self.cache().peek(id)
    }

    pub fn list(&self) -> WormholeResult<Vec<CachedFunction>> {
        self.cache().list()
    }

    /// Drop a cached entry (admin only).
    pub fn remove(&self, id: &str) -> WormholeResult<bool> {
        self.require_admin("remove functions")?;
        self.cache().remove(id)
    }

    pub fn policy_list(&self) -> WormholeResult<PolicySet> {
        self.cache().policy()
    }

    /// Create or replace one capability entry (admin only).
    #[instrument(skip(self), fields(principal = %self.session.principal()))]
    pub fn policy_set(&self, policy: &CapabilityPolicy) -> WormholeResult<()> {
        self.require_admin("change policy")?;
        let record = policy.to_record(self.session.principal());
        Ok(self.session.put_policy(&record)?)
    }

    /// Delete one capability entry (admin only). Absent names stay denied.
    #[instrument(skip(self), fields(principal = %self.session.principal()))]
    pub fn policy_remove(&self, name: &str) -> WormholeResult<bool> {
        self.require_admin("change policy")?;
        Ok(self.session.remove_policy(name)?)
    }

    /// Run `unit` as one transaction, replaying it on transient failure.
    ///
    /// `unit` may be called more than once; everything it does through the
    /// [`Transaction`] is rolled back between attempts.
    pub async fn with_retry<T, F>(&self, ctx: RetryContext, mut unit: F) -> WormholeResult<T>
    where
        F: FnMut(&Transaction<'_, S>) -> WormholeResult<T>,
    {
        retry::with_retry(&self.session, ctx, &self.metrics, |attempt| {
            unit(&Transaction {
                wormhole: self,
                attempt,
            })
        })
        .await
    }

    /// Run `unit` once in a read-only transaction.
    ///
    /// Statements and invocations inside the unit may read but not write;
    /// a write fails without being retried. Invocations here leave
    /// `execution_count` and `last_executed` untouched.
    pub fn read_only<T, F>(&self, cancel: CancelHandle, unit: F) -> WormholeResult<T>
    where
        F: FnOnce(&Transaction<'_, S>) -> WormholeResult<T>,
    {
        retry::read_only(&self.session, cancel, |attempt| {
            unit(&Transaction {
                wormhole: self,
                attempt,
            })
        })
    }

    /// [`Wormhole::with_retry`] with the configured retry defaults.
    pub async fn with_default_retry<T, F>(&self, unit: F) -> WormholeResult<T>
    where
        F: FnMut(&Transaction<'_, S>) -> WormholeResult<T>,
    {
        let ctx = RetryContext::from_defaults(&self.config.retry);
        self.with_retry(ctx, unit).await
    }
}

/// One attempt of a unit of work run by [`Wormhole::with_retry`].
pub struct Transaction<'a, S: DataStore> {
    wormhole: &'a Wormhole<S>,
    attempt: &'a Attempt,
}

impl<S: DataStore> Transaction<'_, S> {
    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt.number()
    }

    pub fn is_read_only(&self) -> bool {
        self.attempt.is_read_only()
    }

    pub fn install(
        &self,
        name: &str,
        source: &str,
        signature: &Signature,
    ) -> WormholeResult<Installed> {
        self.attempt.check_cancelled()?;
        self.wormhole.install(name, source, signature)
    }

    /// Invoke inside the transaction; cancellation reaches the sandbox.
    pub fn invoke(&self, id: &str, args: &serde_json::Value) -> WormholeResult<serde_json::Value> {
        self.attempt.check_cancelled()?;
        self.wormhole.invoke_in(id, args, Some(self.attempt))
    }

    /// Raw statement on the transaction's session.
    pub fn execute(
        &self,
        statement: &str,
        params: &[serde_json::Value],
    ) -> WormholeResult<serde_json::Value> {
        let envelope = QueryBridge::new(&self.wormhole.session)
            .run_json(statement, params)
            .map_err(|err| match err {
                BridgeError::Transient(state) => WormholeError::from(state),
                other => WormholeError::execution(ExecutionKind::BridgeError, other.to_string()),
            })?;
        Ok(envelope.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wormhole_state::{FunctionStore, PolicyStore, Session, SqliteHandle, SqliteSession};

    fn wormhole(principal: &str) -> (SqliteHandle, Wormhole<SqliteSession>) {
        let handle = SqliteHandle::in_memory().unwrap();
        let admin = handle.session_as("admin").unwrap();
        for policy in PolicySet::standard().iter() {
            admin.put_policy(&policy.to_record("admin")).unwrap();
        }
        let session = handle.session_as(principal).unwrap();
        let config = WormholeConfig::default().with_admin("admin");
        (handle, Wormhole::new(session, config).unwrap())
    }

    #[test]
    fn install_then_invoke() {
        let (_handle, wh) = wormhole("alice");
        let installed = wh
            .install(
                "double",
                "def double(x):\n    return x * 2\n",
                &Signature::new(["x"]),
            )
            .unwrap();
        assert!(!installed.cached);
        assert_eq!(wh.invoke(&installed.id, &json!([21])).unwrap(), json!(42));
        assert_eq!(wh.invoke(&installed.id, &json!({"x": "ab"})).unwrap(), json!("abab"));
        assert_eq!(wh.metrics().invocations(), 2);
        assert_eq!(wh.peek(&installed.id).unwrap().execution_count, 2);
    }

    #[test]
    fn check_does_not_cache() {
        let (_handle, wh) = wormhole("alice");
        let report = wh.check("import os\n").unwrap();
        assert!(!report.accepted);
        assert!(wh.check("import math\n").unwrap().accepted);
        assert!(wh.list().unwrap().is_empty());
    }

    #[test]
    fn policy_writes_need_an_admin() {
        let (handle, wh) = wormhole("alice");
        let err = wh
            .policy_set(&CapabilityPolicy::allow("os", "please"))
            .unwrap_err();
        assert!(matches!(err, WormholeError::PermissionDenied { .. }));
        assert!(!wh.policy_list().unwrap().is_allowed("os"));

        let admin = Wormhole::new(
            handle.session_as("admin").unwrap(),
            WormholeConfig::default().with_admin("admin"),
        )
        .unwrap();
        admin
            .policy_set(&CapabilityPolicy::deny("json", "not today"))
            .unwrap();
        assert!(!wh.policy_list().unwrap().is_allowed("json"));
        assert!(admin.policy_remove("json").unwrap());
        assert!(wh.policy_list().unwrap().get("json").is_none());
    }

    #[test]
    fn remove_needs_an_admin() {
        let (_handle, wh) = wormhole("alice");
        let installed = wh
            .install("one", "def one():\n    return 1\n", &Signature::default())
            .unwrap();
        assert!(matches!(
            wh.remove(&installed.id),
            Err(WormholeError::PermissionDenied { .. })
        ));
        assert!(wh.peek(&installed.id).is_ok());
    }

    #[tokio::test]
    async fn transaction_commits_installs_and_invocations() {
        let (_handle, wh) = wormhole("alice");
        let id = wh
            .with_retry(RetryContext::new(1), |tx| {
                let installed = tx.install(
                    "three",
                    "def three():\n    return 3\n",
                    &Signature::default(),
                )?;
                assert_eq!(tx.invoke(&installed.id, &json!(null))?, json!(3));
                Ok(installed.id)
            })
            .await
            .unwrap();
        assert_eq!(wh.peek(&id).unwrap().execution_count, 1);
    }

    #[test]
    fn sandboxed_code_cannot_rewrite_policy() {
        let (_handle, wh) = wormhole("alice");
        let installed = wh
            .install(
                "esc",
                "def esc():\n    return query(\"UPDATE wormhole_policy SET allowed = 1 WHERE name = 'os'\")\n",
                &Signature::default(),
            )
            .unwrap();
        let err = wh.invoke(&installed.id, &json!(null)).unwrap_err();
        assert!(
            matches!(
                err,
                WormholeError::Execution {
                    kind: ExecutionKind::BridgeError,
                    ..
                }
            ),
            "{err}"
        );
        assert!(!wh.policy_list().unwrap().is_allowed("os"));
        assert!(!wh.check("import os\n").unwrap().accepted);
    }

    #[test]
    fn sandboxed_code_cannot_rewrite_cached_functions() {
        let (_handle, wh) = wormhole("alice");
        let victim = wh
            .install("one", "def one():\n    return 1\n", &Signature::default())
            .unwrap();
        let swap = wh
            .install(
                "swap",
                "def swap(victim):\n    return query('UPDATE wormhole_functions SET program = source WHERE id = $1', [victim])\n",
                &Signature::new(["victim"]),
            )
            .unwrap();
        let err = wh.invoke(&swap.id, &json!([victim.id])).unwrap_err();
        assert!(matches!(err, WormholeError::Execution { .. }), "{err}");
        assert!(wh.session().get_function(&victim.id).unwrap().unwrap().is_intact());
        assert_eq!(wh.invoke(&victim.id, &json!(null)).unwrap(), json!(1));
    }

    #[test]
    fn read_only_unit_reads_without_bookkeeping() {
        let (_handle, wh) = wormhole("alice");
        wh.session()
            .execute("CREATE TABLE notes (body TEXT NOT NULL)", &[])
            .unwrap();
        wh.session()
            .execute("INSERT INTO notes (body) VALUES ('hi')", &[])
            .unwrap();
        let installed = wh
            .install(
                "count_notes",
                "def count_notes():\n    return query('SELECT count(*) AS n FROM notes')[0]['n']\n",
                &Signature::default(),
            )
            .unwrap();

        let n = wh
            .read_only(CancelHandle::new(), |tx| {
                assert!(tx.is_read_only());
                tx.invoke(&installed.id, &json!(null))
            })
            .unwrap();
        assert_eq!(n, json!(1));
        assert_eq!(wh.peek(&installed.id).unwrap().execution_count, 0);
    }

    #[test]
    fn write_in_read_only_unit_is_refused() {
        let (_handle, wh) = wormhole("alice");
        wh.session()
            .execute("CREATE TABLE notes (body TEXT NOT NULL)", &[])
            .unwrap();
        let mut runs = 0;
        let err = wh
            .read_only(CancelHandle::new(), |tx| {
                runs += 1;
                tx.execute("INSERT INTO notes (body) VALUES ($1)", &[json!("nope")])
            })
            .unwrap_err();
        assert!(!err.is_transient(), "{err}");
        assert!(err.to_string().contains("read-only"), "{err}");
        assert_eq!(runs, 1);
        assert!(!wh.session().in_transaction());

        let rows = wh
            .session()
            .execute("SELECT count(*) AS n FROM notes", &[])
            .unwrap();
        assert_eq!(rows.rows[0]["n"], wormhole_state::Scalar::Int(0));
    }
}
