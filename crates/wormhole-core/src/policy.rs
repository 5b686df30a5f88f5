//! Capability policy: a flat, default-deny allow-list keyed by name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use wormhole_state::PolicyRecord;

/// One named capability and whether submitted functions may use it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPolicy {
    pub name: String,
    pub allowed: bool,
    /// Audit note explaining the decision.
    #[serde(default)]
    pub note: String,
}

impl CapabilityPolicy {
    pub fn allow(name: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allowed: true,
            note: note.into(),
        }
    }

    pub fn deny(name: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allowed: false,
            note: note.into(),
        }
    }

    /// Store row for this entry, stamped with `principal` and the current time.
    pub fn to_record(&self, principal: &str) -> PolicyRecord {
        PolicyRecord::new(&self.name, self.allowed, &self.note, principal)
    }
}

impl From<PolicyRecord> for CapabilityPolicy {
    fn from(record: PolicyRecord) -> Self {
        Self {
            name: record.name,
            allowed: record.allowed,
            note: record.note,
        }
    }
}

/// Capability policies keyed by name.
///
/// Absence is not permission: a name with no entry is denied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    entries: BTreeMap<String, CapabilityPolicy>,
}

impl PolicySet {
    /// Create an empty policy set (everything denied by default).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Insert or replace an entry and return `self` (builder pattern).
    pub fn with(mut self, policy: CapabilityPolicy) -> Self {
        self.insert(policy);
        self
    }

    pub fn insert(&mut self, policy: CapabilityPolicy) {
        self.entries.insert(policy.name.clone(), policy);
    }

    /// `true` only for an entry that exists and is allowed.
    pub fn is_allowed(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|p| p.allowed)
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityPolicy> {
        self.entries.get(name)
    }

    /// Entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = &CapabilityPolicy> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The standard seed policy.
    ///
    /// | Capability | Allowed | Note |
    /// |------------|---------|------|
    /// | math       |    ✓    | pure numeric helpers |
    /// | json       |    ✓    | encoding only |
    /// | re         |    ✓    | pattern matching on values |
    /// | datetime   |    ✓    | clock reads |
    /// | os, sys, subprocess, socket, shutil, pathlib, importlib, ctypes, pickle | ✗ | host access |
    pub fn standard() -> Self {
        let mut set = Self::empty()
            .with(CapabilityPolicy::allow("math", "pure numeric helpers"))
            .with(CapabilityPolicy::allow("json", "value encoding and decoding"))
            .with(CapabilityPolicy::allow("re", "pattern matching on values"))
            .with(CapabilityPolicy::allow("datetime", "clock reads, ISO-8601 text"));

        let denied: &[(&str, &str)] = &[
            ("os", "process environment and filesystem"),
            ("sys", "interpreter internals"),
            ("subprocess", "process spawning"),
            ("socket", "network access"),
            ("shutil", "filesystem mutation"),
            ("pathlib", "filesystem access"),
            ("importlib", "dynamic import"),
            ("ctypes", "native memory access"),
            ("pickle", "arbitrary object construction"),
        ];
        for (name, note) in denied {
            set.insert(CapabilityPolicy::deny(*name, *note));
        }
        set
    }
}

impl FromIterator<CapabilityPolicy> for PolicySet {
    fn from_iter<I: IntoIterator<Item = CapabilityPolicy>>(iter: I) -> Self {
        let mut set = Self::empty();
        for policy in iter {
            set.insert(policy);
        }
        set
    }
}

impl FromIterator<PolicyRecord> for PolicySet {
    fn from_iter<I: IntoIterator<Item = PolicyRecord>>(iter: I) -> Self {
        iter.into_iter().map(CapabilityPolicy::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_names_are_denied() {
        let set = PolicySet::empty();
        assert!(!set.is_allowed("math"));
    }

    #[test]
    fn explicit_deny_is_denied() {
        let set = PolicySet::empty().with(CapabilityPolicy::deny("os", "host"));
        assert!(!set.is_allowed("os"));
        assert_eq!(set.get("os").unwrap().note, "host");
    }

    #[test]
    fn later_entry_replaces_earlier() {
        let set = PolicySet::empty()
            .with(CapabilityPolicy::deny("json", "not yet"))
            .with(CapabilityPolicy::allow("json", "approved"));
        assert!(set.is_allowed("json"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn standard_policy_shape() {
        let set = PolicySet::standard();
        for allowed in ["math", "json", "re", "datetime"] {
            assert!(set.is_allowed(allowed), "{allowed} should be allowed");
        }
        for denied in ["os", "sys", "subprocess", "socket", "pickle"] {
            assert!(!set.is_allowed(denied), "{denied} should be denied");
            assert!(!set.get(denied).unwrap().note.is_empty());
        }
        assert!(!set.is_allowed("requests"));
    }

    #[test]
    fn builds_from_store_rows() {
        let rows = vec![
            PolicyRecord::new("math", true, "numeric", "admin"),
            PolicyRecord::new("os", false, "host", "admin"),
        ];
        let set: PolicySet = rows.into_iter().collect();
        assert!(set.is_allowed("math"));
        assert!(!set.is_allowed("os"));
    }

    #[test]
    fn serde_roundtrip() {
        let set = PolicySet::standard();
        let json = serde_json::to_string(&set).unwrap();
        let back: PolicySet = serde_json::from_str(&json).unwrap();
        assert_eq!(set, back);
    }
}
