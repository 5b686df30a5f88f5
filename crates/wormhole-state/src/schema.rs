//! Schema definitions for the Wormhole tables
//!
//! Tables:
//! - wormhole_functions: Content-addressed function cache (append-mostly)
//! - wormhole_policy: Capability allow-list

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::ContentDigest;

/// One row of the function cache.
///
/// `signature` and `program` are opaque JSON documents at this layer; the
/// core owns their shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// `<name>_<hash prefix>`
    pub id: String,
    /// Entry function name
    pub name: String,
    /// Exact admitted source text
    pub source: String,
    /// Declared signature
    pub signature: serde_json::Value,
    /// Pre-parsed syntax tree, cached next to the source
    pub program: serde_json::Value,
    /// SHA-256 hex of `source`
    pub source_hash: String,
    /// SHA-256 hex of `program` as compact JSON, taken when it was validated
    pub program_hash: String,
    /// Principal that admitted the function
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_executed: Option<DateTime<Utc>>,
    pub execution_count: u64,
    /// Whether a unit that invoked this function may be replayed
    pub idempotent: bool,
}

impl FunctionRecord {
    /// Digest of a syntax tree document.
    pub fn program_digest(program: &serde_json::Value) -> ContentDigest {
        ContentDigest::from_bytes(program.to_string().as_bytes())
    }

    /// Whether the stored hash is still the hash of the stored source.
    pub fn hash_matches_source(&self) -> bool {
        ContentDigest::from_bytes(self.source.as_bytes()).as_str() == self.source_hash
    }

    /// Whether the stored tree is still the tree that was validated.
    pub fn hash_matches_program(&self) -> bool {
        Self::program_digest(&self.program).as_str() == self.program_hash
    }

    /// Both hashes hold.
    pub fn is_intact(&self) -> bool {
        self.hash_matches_source() && self.hash_matches_program()
    }
}

/// One row of the capability allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub name: String,
    pub allowed: bool,
    /// Audit note explaining the decision
    pub note: String,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl PolicyRecord {
    /// Create a policy row stamped with the current time.
    pub fn new(
        name: impl Into<String>,
        allowed: bool,
        note: impl Into<String>,
        updated_by: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            allowed,
            note: note.into(),
            updated_by: updated_by.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Result of inserting a function row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    /// The row was written.
    Inserted,
    /// A row with the same id already existed (admission race lost).
    AlreadyExists,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(source: &str) -> FunctionRecord {
        let digest = ContentDigest::from_bytes(source.as_bytes());
        let program = serde_json::json!([{"def": "f", "body": [1.5, 0.1]}]);
        FunctionRecord {
            id: format!("f_{}", digest.prefix(16)),
            name: "f".to_string(),
            source: source.to_string(),
            signature: serde_json::json!({"params": []}),
            program_hash: FunctionRecord::program_digest(&program).to_string(),
            program,
            source_hash: digest.as_str().to_string(),
            created_by: "tester".to_string(),
            created_at: Utc::now(),
            last_executed: None,
            execution_count: 0,
            idempotent: true,
        }
    }

    #[test]
    fn hash_matches_source_detects_drift() {
        let mut rec = record("def f():\n    return 1\n");
        assert!(rec.hash_matches_source());
        rec.source.push_str("# edited\n");
        assert!(!rec.hash_matches_source());
        assert!(!rec.is_intact());
    }

    #[test]
    fn hash_matches_program_detects_swapped_tree() {
        let mut rec = record("def f():\n    return 1\n");
        assert!(rec.hash_matches_program());
        assert!(rec.is_intact());
        rec.program = serde_json::json!([{"def": "f", "body": []}]);
        assert!(rec.hash_matches_source());
        assert!(!rec.hash_matches_program());
        assert!(!rec.is_intact());
    }

    #[test]
    fn policy_record_serde_roundtrip() {
        let rec = PolicyRecord::new("math", true, "pure numeric helpers", "admin");
        let json = serde_json::to_string(&rec).unwrap();
        let back: PolicyRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, back);
    }
}
