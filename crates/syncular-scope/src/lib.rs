//! Scope engine: converts subscription scope specs into opaque scope-key
//! strings, partitions them, and authorizes access through table handlers.
//!
//! Two string shapes exist and must never be confused:
//! - [`ScopeKey`]: `"prefix:value"`, derived from a scope map entry.
//! - [`PartitionedScopeKey`]: `"partition::prefix:value"`, the only form the
//!   realtime registry indexes. It can only be built from a `PartitionId`
//!   plus a `ScopeKey`, so an unprefixed key cannot reach the registry.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use syncular_schemas::{PartitionId, ScopeMap};

pub mod handler;

pub use handler::{HandlerRegistry, PrincipalScopeHandler, ScopeResolution, TableHandler};

// ---------------------------------------------------------------------------
// ScopeKey
// ---------------------------------------------------------------------------

/// A flat `"prefix:value"` authorization key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn new(prefix: &str, value: &str) -> Self {
        Self(format!("{prefix}:{value}"))
    }

    /// Parse an already-flat key. Returns `None` when the separator is
    /// missing or either side is empty.
    pub fn parse(s: &str) -> Option<Self> {
        let (prefix, value) = s.split_once(':')?;
        if prefix.is_empty() || value.is_empty() {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn prefix(&self) -> &str {
        self.0.split_once(':').map(|(p, _)| p).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// PartitionedScopeKey
// ---------------------------------------------------------------------------

/// `"partition::prefix:value"`. The registry indexes only this form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionedScopeKey(String);

impl PartitionedScopeKey {
    pub fn new(partition: &PartitionId, key: &ScopeKey) -> Self {
        Self(format!("{}::{}", partition.as_str(), key.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn partition(&self) -> &str {
        self.0.split_once("::").map(|(p, _)| p).unwrap_or(&self.0)
    }

    pub fn scope_key(&self) -> Option<ScopeKey> {
        self.0
            .split_once("::")
            .and_then(|(_, rest)| ScopeKey::parse(rest))
    }
}

impl std::fmt::Display for PartitionedScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Scope-map key → scope-key prefix: a trailing `_id` is stripped, so
/// `user_id` becomes `user`. A bare `_id` (nothing left after stripping)
/// keeps its original form.
pub fn scope_prefix(map_key: &str) -> &str {
    match map_key.strip_suffix("_id") {
        Some(p) if !p.is_empty() => p,
        _ => map_key,
    }
}

/// Expand a scope map into the full set of flat scope keys.
/// `{user_id: ["u1","u2"]}` → `{user:u1, user:u2}`.
pub fn scope_keys_from_map(scopes: &ScopeMap) -> BTreeSet<ScopeKey> {
    let mut out = BTreeSet::new();
    for (k, v) in scopes {
        let prefix = scope_prefix(k);
        for value in v.values() {
            out.insert(ScopeKey::new(prefix, value));
        }
    }
    out
}

/// Partition-prefix a set of scope keys for registry consumption.
pub fn partition_keys<'a, I>(partition: &PartitionId, keys: I) -> Vec<PartitionedScopeKey>
where
    I: IntoIterator<Item = &'a ScopeKey>,
{
    keys.into_iter()
        .map(|k| PartitionedScopeKey::new(partition, k))
        .collect()
}

/// True when at least one of the change's scope keys is in `effective`.
pub fn change_matches(change_scopes: &ScopeMap, effective: &BTreeSet<ScopeKey>) -> bool {
    scope_keys_from_map(change_scopes)
        .iter()
        .any(|k| effective.contains(k))
}
