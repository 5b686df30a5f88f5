//! Function Cache: admitted functions stored under a content-derived id.
//!
//! The id is `<name>_<first 16 hex chars of sha256(source)>`, so the same
//! source admitted twice lands on the same row and skips validation. Rows
//! carry the parsed syntax tree next to the source; execution never parses
//! again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use wormhole_state::{
    with_savepoint, ContentDigest, FunctionRecord, FunctionStore, InsertOutcome, PolicyStore,
    Session, StateError,
};

use crate::error::{WormholeError, WormholeResult};
use crate::lang::{lexer, Program};
use crate::metrics::Metrics;
use crate::obs;
use crate::policy::{CapabilityPolicy, PolicySet};
use crate::validator::{ValidationReport, Validator, Violation, ViolationKind};

/// Hex chars of the source hash used in a function id.
pub const ID_HASH_LEN: usize = 16;

fn default_idempotent() -> bool {
    true
}

/// Declared signature of an admitted function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Parameter names, informational.
    #[serde(default)]
    pub params: Vec<String>,
    /// Whether a unit of work that ran this function may be replayed.
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
}

impl Default for Signature {
    fn default() -> Self {
        Self {
            params: Vec::new(),
            idempotent: true,
        }
    }
}

impl Signature {
    pub fn new<I, P>(params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            idempotent: true,
        }
    }

    /// Mark the function as having effects a replay must not repeat.
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }
}

/// `<name>_<hash prefix>` for `source`.
pub fn function_id(name: &str, source: &str) -> String {
    let digest = ContentDigest::from_bytes(source.as_bytes());
    format!("{name}_{}", digest.prefix(ID_HASH_LEN))
}

/// A cache entry with its syntax tree decoded and its hash verified.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedFunction {
    pub id: String,
    pub name: String,
    pub source: String,
    pub signature: Signature,
    pub program: Program,
    pub source_hash: String,
    pub program_hash: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_executed: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub idempotent: bool,
}

impl TryFrom<FunctionRecord> for CachedFunction {
    type Error = WormholeError;

    fn try_from(record: FunctionRecord) -> WormholeResult<Self> {
        if !record.is_intact() {
            return Err(WormholeError::Integrity { id: record.id });
        }
        let FunctionRecord {
            id,
            name,
            source,
            signature,
            program,
            source_hash,
            program_hash,
            created_by,
            created_at,
            last_executed,
            execution_count,
            idempotent,
        } = record;

        let signature: Signature = serde_json::from_value(signature).map_err(|e| {
            WormholeError::Storage(StateError::Deserialization(format!(
                "signature of {id}: {e}"
            )))
        })?;
        let program: Program = serde_json::from_value(program).map_err(|e| {
            WormholeError::Storage(StateError::Deserialization(format!(
                "syntax tree of {id}: {e}"
            )))
        })?;

        Ok(Self {
            id,
            name,
            source,
            signature,
            program,
            source_hash,
            program_hash,
            created_by,
            created_at,
            last_executed,
            execution_count,
            idempotent,
        })
    }
}

/// Result of an admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub id: String,
    /// `false` when the id was already cached and validation was skipped.
    pub was_new: bool,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !lexer::KEYWORDS.contains(&name)
}

/// Admission and lookup over a store's function table.
pub struct FunctionCache<'a, S: ?Sized> {
    store: &'a S,
    metrics: &'a Metrics,
    bridge_binding: &'a str,
}

impl<'a, S> FunctionCache<'a, S>
where
    S: Session + FunctionStore + PolicyStore + ?Sized,
{
    pub fn new(store: &'a S, metrics: &'a Metrics, bridge_binding: &'a str) -> Self {
        Self {
            store,
            metrics,
            bridge_binding,
        }
    }

    /// The capability policy as currently stored.
    pub fn policy(&self) -> WormholeResult<PolicySet> {
        Ok(self
            .store
            .load_policy()?
            .into_iter()
            .map(CapabilityPolicy::from)
            .collect())
    }

    /// Validate and store `source`, or return the existing entry's id.
    #[instrument(skip(self, source, signature), fields(principal = %self.store.principal()))]
    pub fn admit(
        &self,
        name: &str,
        source: &str,
        signature: &Signature,
    ) -> WormholeResult<Admission> {
        if !is_identifier(name) {
            return Err(WormholeError::Syntax(ValidationReport::from_violations(
                vec![Violation {
                    kind: ViolationKind::SyntaxError,
                    detail: format!("'{name}' is not a valid function name"),
                    line: 0,
                    col: 0,
                }],
            )));
        }

        let id = function_id(name, source);
        if let Some(existing) = self.store.get_function(&id)? {
            return self.cache_hit(existing);
        }

        let policy = self.policy()?;
        self.metrics.inc_validations();
        let (report, program) =
            Validator::new(&policy, self.bridge_binding).validate_program(source);
        let Some(program) = program else {
            let first = report
                .violations
                .first()
                .map(ToString::to_string)
                .unwrap_or_default();
            obs::emit_admission_rejected(name, report.violations.len(), &first);
            return Err(if report.is_syntax_error() {
                WormholeError::Syntax(report)
            } else {
                WormholeError::PolicyViolation(report)
            });
        };

        let digest = ContentDigest::from_bytes(source.as_bytes());
        let program = serde_json::to_value(&program)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        let record = FunctionRecord {
            id: id.clone(),
            name: name.to_string(),
            source: source.to_string(),
            signature: serde_json::to_value(signature)
                .map_err(|e| StateError::Serialization(e.to_string()))?,
            program_hash: FunctionRecord::program_digest(&program).to_string(),
            program,
            source_hash: digest.as_str().to_string(),
            created_by: self.store.principal().to_string(),
            created_at: Utc::now(),
            last_executed: None,
            execution_count: 0,
            idempotent: signature.idempotent,
        };

        match self.store.insert_function(&record)? {
            InsertOutcome::Inserted => {
                self.metrics.inc_admissions();
                obs::emit_admitted(&id, true, self.store.principal());
                Ok(Admission { id, was_new: true })
            }
            InsertOutcome::AlreadyExists => {
                debug!(function = %id, "admission race lost, using existing entry");
                match self.store.get_function(&id)? {
                    Some(existing) => self.cache_hit(existing),
                    None => Err(WormholeError::NotFound(id)),
                }
            }
        }
    }

    fn cache_hit(&self, existing: FunctionRecord) -> WormholeResult<Admission> {
        if !existing.is_intact() {
            return Err(WormholeError::Integrity { id: existing.id });
        }
        self.metrics.inc_cache_hits();
        obs::emit_admitted(&existing.id, false, self.store.principal());
        Ok(Admission {
            id: existing.id,
            was_new: false,
        })
    }

    /// Fetch an entry for execution, bumping its bookkeeping atomically.
    #[instrument(skip(self))]
    pub fn lookup(&self, id: &str) -> WormholeResult<CachedFunction> {
        with_savepoint(self.store, "wormhole_lookup", || {
            match self.store.record_execution(id, Utc::now())? {
                Some(record) => CachedFunction::try_from(record),
                None => Err(WormholeError::NotFound(id.to_string())),
            }
        })
    }

    /// Fetch an entry without touching bookkeeping.
    pub fn peek(&self, id: &str) -> WormholeResult<CachedFunction> {
        match self.store.get_function(id)? {
            Some(record) => CachedFunction::try_from(record),
            None => Err(WormholeError::NotFound(id.to_string())),
        }
    }

    /// All entries, ordered by name then creation time.
    pub fn list(&self) -> WormholeResult<Vec<CachedFunction>> {
        self.store
            .list_functions()?
            .into_iter()
            .map(CachedFunction::try_from)
            .collect()
    }

    /// Drop an entry. Returns whether one existed.
    pub fn remove(&self, id: &str) -> WormholeResult<bool> {
        Ok(self.store.delete_function(id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wormhole_state::SqliteHandle;

    const SUM: &str = "import math\n\ndef total(xs):\n    return math.fsum(xs)\n";

    fn store() -> (SqliteHandle, wormhole_state::SqliteSession) {
        let handle = SqliteHandle::in_memory().unwrap();
        let session = handle.session().unwrap();
        for policy in PolicySet::standard().iter() {
            session.put_policy(&policy.to_record("admin")).unwrap();
        }
        (handle, session)
    }

    #[test]
    fn id_is_name_plus_hash_prefix() {
        let id = function_id("total", SUM);
        let digest = ContentDigest::from_bytes(SUM.as_bytes());
        assert_eq!(id, format!("total_{}", &digest.as_str()[..16]));
        assert_ne!(id, function_id("total", "def total(xs):\n    return 0\n"));
    }

    #[test]
    fn resubmission_hits_cache_without_validating() {
        let (_handle, session) = store();
        let metrics = Metrics::new();
        let cache = FunctionCache::new(&session, &metrics, "query");

        let first = cache.admit("total", SUM, &Signature::new(["xs"])).unwrap();
        assert!(first.was_new);
        assert_eq!(metrics.validations(), 1);

        let second = cache.admit("total", SUM, &Signature::new(["xs"])).unwrap();
        assert_eq!(second.id, first.id);
        assert!(!second.was_new);
        assert_eq!(metrics.validations(), 1);
        assert_eq!(metrics.cache_hits(), 1);
    }

    #[test]
    fn rejection_stores_nothing() {
        let (_handle, session) = store();
        let metrics = Metrics::new();
        let cache = FunctionCache::new(&session, &metrics, "query");

        let err = cache
            .admit("leak", "import os\n\ndef leak():\n    return 1\n", &Signature::default())
            .unwrap_err();
        let report = err.report().unwrap();
        assert!(report.has(ViolationKind::DisallowedCapability, "os"));
        assert!(matches!(err, WormholeError::PolicyViolation(_)));
        assert!(cache.list().unwrap().is_empty());
    }

    #[test]
    fn syntax_errors_and_bad_names_are_syntax_reports() {
        let (_handle, session) = store();
        let metrics = Metrics::new();
        let cache = FunctionCache::new(&session, &metrics, "query");

        let err = cache
            .admit("broken", "def broken(:\n    pass\n", &Signature::default())
            .unwrap_err();
        assert!(matches!(err, WormholeError::Syntax(_)));

        let err = cache
            .admit("not a name", "def f():\n    pass\n", &Signature::default())
            .unwrap_err();
        assert!(matches!(err, WormholeError::Syntax(_)));
    }

    #[test]
    fn lookup_counts_and_peek_does_not() {
        let (_handle, session) = store();
        let metrics = Metrics::new();
        let cache = FunctionCache::new(&session, &metrics, "query");
        let admission = cache.admit("total", SUM, &Signature::default()).unwrap();

        let peeked = cache.peek(&admission.id).unwrap();
        assert_eq!(peeked.execution_count, 0);
        assert!(peeked.last_executed.is_none());
        assert_eq!(peeked.program.function("total").unwrap().params.len(), 1);

        let looked_up = cache.lookup(&admission.id).unwrap();
        assert_eq!(looked_up.execution_count, 1);
        assert!(looked_up.last_executed.is_some());
        assert_eq!(cache.lookup(&admission.id).unwrap().execution_count, 2);
        assert_eq!(cache.peek(&admission.id).unwrap().execution_count, 2);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let (_handle, session) = store();
        let metrics = Metrics::new();
        let cache = FunctionCache::new(&session, &metrics, "query");
        assert!(matches!(
            cache.lookup("nope_0000000000000000"),
            Err(WormholeError::NotFound(_))
        ));
        assert!(matches!(
            cache.peek("nope_0000000000000000"),
            Err(WormholeError::NotFound(_))
        ));
    }

    #[test]
    fn idempotence_comes_from_the_signature() {
        let (_handle, session) = store();
        let metrics = Metrics::new();
        let cache = FunctionCache::new(&session, &metrics, "query");
        let source = "def notify(x):\n    return x\n";
        let admission = cache
            .admit("notify", source, &Signature::new(["x"]).non_idempotent())
            .unwrap();
        let cached = cache.peek(&admission.id).unwrap();
        assert!(!cached.idempotent);
        assert!(!cached.signature.idempotent);
        assert_eq!(cached.signature.params, vec!["x"]);
    }

    #[test]
    fn tampered_source_is_an_integrity_error() {
        let (_handle, session) = store();
        let metrics = Metrics::new();
        let cache = FunctionCache::new(&session, &metrics, "query");
        let admission = cache.admit("total", SUM, &Signature::default()).unwrap();

        session
            .execute(
                "UPDATE wormhole_functions SET source = source || '# edited' WHERE id = $1",
                &[wormhole_state::Scalar::Text(admission.id.clone())],
            )
            .unwrap();
        assert!(matches!(
            cache.peek(&admission.id),
            Err(WormholeError::Integrity { .. })
        ));
        assert!(matches!(
            cache.admit("total", SUM, &Signature::default()),
            Err(WormholeError::Integrity { .. })
        ));
    }

    #[test]
    fn swapped_syntax_tree_is_an_integrity_error() {
        let (_handle, session) = store();
        let metrics = Metrics::new();
        let cache = FunctionCache::new(&session, &metrics, "query");
        let victim = cache.admit("total", SUM, &Signature::default()).unwrap();
        let donor = cache
            .admit("other", "def other():\n    return query('SELECT 1')\n", &Signature::default())
            .unwrap();

        session
            .execute(
                "UPDATE wormhole_functions \
                 SET program = (SELECT program FROM wormhole_functions WHERE id = $2) \
                 WHERE id = $1",
                &[
                    wormhole_state::Scalar::Text(victim.id.clone()),
                    wormhole_state::Scalar::Text(donor.id.clone()),
                ],
            )
            .unwrap();
        assert!(matches!(
            cache.peek(&victim.id),
            Err(WormholeError::Integrity { .. })
        ));
        assert!(matches!(
            cache.lookup(&victim.id),
            Err(WormholeError::Integrity { .. })
        ));
        assert!(cache.peek(&donor.id).is_ok());
    }

    /// Misses the first lookup, as a session does when another admission of
    /// the same source commits between its lookup and its insert.
    struct LateStore<'a> {
        inner: &'a wormhole_state::SqliteSession,
        misses: std::cell::Cell<u32>,
    }

    impl Session for LateStore<'_> {
        fn principal(&self) -> &str {
            "bob"
        }
        fn execute(
            &self,
            statement: &str,
            params: &[wormhole_state::Scalar],
        ) -> wormhole_state::StorageResult<wormhole_state::QueryOutcome> {
            self.inner.execute(statement, params)
        }
        fn execute_confined(
            &self,
            statement: &str,
            params: &[wormhole_state::Scalar],
        ) -> wormhole_state::StorageResult<wormhole_state::QueryOutcome> {
            self.inner.execute_confined(statement, params)
        }
        fn begin(&self) -> wormhole_state::StorageResult<()> {
            self.inner.begin()
        }
        fn begin_read_only(&self) -> wormhole_state::StorageResult<()> {
            self.inner.begin_read_only()
        }
        fn commit(&self) -> wormhole_state::StorageResult<()> {
            self.inner.commit()
        }
        fn rollback(&self) -> wormhole_state::StorageResult<()> {
            self.inner.rollback()
        }
        fn in_transaction(&self) -> bool {
            self.inner.in_transaction()
        }
        fn savepoint(&self, name: &str) -> wormhole_state::StorageResult<()> {
            self.inner.savepoint(name)
        }
        fn release_savepoint(&self, name: &str) -> wormhole_state::StorageResult<()> {
            self.inner.release_savepoint(name)
        }
        fn rollback_to_savepoint(&self, name: &str) -> wormhole_state::StorageResult<()> {
            self.inner.rollback_to_savepoint(name)
        }
    }

    impl FunctionStore for LateStore<'_> {
        fn get_function(&self, id: &str) -> wormhole_state::StorageResult<Option<FunctionRecord>> {
            if self.misses.get() > 0 {
                self.misses.set(self.misses.get() - 1);
                return Ok(None);
            }
            self.inner.get_function(id)
        }
        fn insert_function(
            &self,
            record: &FunctionRecord,
        ) -> wormhole_state::StorageResult<InsertOutcome> {
            self.inner.insert_function(record)
        }
        fn record_execution(
            &self,
            id: &str,
            at: DateTime<Utc>,
        ) -> wormhole_state::StorageResult<Option<FunctionRecord>> {
            self.inner.record_execution(id, at)
        }
        fn list_functions(&self) -> wormhole_state::StorageResult<Vec<FunctionRecord>> {
            self.inner.list_functions()
        }
        fn delete_function(&self, id: &str) -> wormhole_state::StorageResult<bool> {
            self.inner.delete_function(id)
        }
    }

    impl PolicyStore for LateStore<'_> {
        fn load_policy(&self) -> wormhole_state::StorageResult<Vec<wormhole_state::PolicyRecord>> {
            self.inner.load_policy()
        }
        fn put_policy(
            &self,
            record: &wormhole_state::PolicyRecord,
        ) -> wormhole_state::StorageResult<()> {
            self.inner.put_policy(record)
        }
        fn remove_policy(&self, name: &str) -> wormhole_state::StorageResult<bool> {
            self.inner.remove_policy(name)
        }
    }

    #[test]
    fn losing_an_admission_race_is_a_cache_hit() {
        let (handle, session) = store();
        let metrics = Metrics::new();
        let winner = FunctionCache::new(&session, &metrics, "query")
            .admit("total", SUM, &Signature::default())
            .unwrap();
        assert!(winner.was_new);

        let other = handle.session_as("bob").unwrap();
        let late = LateStore {
            inner: &other,
            misses: std::cell::Cell::new(1),
        };
        let loser_metrics = Metrics::new();
        let loser = FunctionCache::new(&late, &loser_metrics, "query")
            .admit("total", SUM, &Signature::default())
            .unwrap();

        assert_eq!(loser.id, winner.id);
        assert!(!loser.was_new);
        assert_eq!(loser_metrics.validations(), 1);
        assert_eq!(loser_metrics.admissions(), 0);
        assert_eq!(loser_metrics.cache_hits(), 1);
        assert_eq!(late.misses.get(), 0);
        assert_eq!(session.list_functions().unwrap().len(), 1);
    }

    #[test]
    fn remove_deletes_the_entry() {
        let (_handle, session) = store();
        let metrics = Metrics::new();
        let cache = FunctionCache::new(&session, &metrics, "query");
        let admission = cache.admit("total", SUM, &Signature::default()).unwrap();
        assert!(cache.remove(&admission.id).unwrap());
        assert!(!cache.remove(&admission.id).unwrap());
        assert!(cache.list().unwrap().is_empty());
    }
}
