//! Table handler boundary.
//!
//! This module defines **only** the resolution types, the handler trait, and
//! the registry. Concrete authorization policies beyond the default
//! principal-subset check live with the deployment that wires them in.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use syncular_schemas::{Principal, ScopeMap};

use crate::{scope_keys_from_map, ScopeKey};

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Outcome of resolving a subscription's requested scopes for a principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeResolution {
    /// The effective scope set this principal may read for the table.
    Granted(BTreeSet<ScopeKey>),
    /// The request asks for scopes outside the allowed set. Maps to
    /// `INVALID_SUBSCRIPTION`.
    Denied,
    /// A previously authorised scope set no longer intersects the allowed
    /// set; the client must discard its local rows.
    Revoked,
}

// ---------------------------------------------------------------------------
// Handler trait + registry
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TableHandler: Send + Sync {
    fn table(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    /// Resolve the effective scope set for `principal` given the
    /// subscription's requested `scopes` and optional handler params.
    async fn resolve_scopes(
        &self,
        principal: &Principal,
        requested: &ScopeMap,
        params: Option<&Value>,
    ) -> ScopeResolution;

    /// Materialise the scope mapping attached to a row at commit time.
    /// Default: every top-level `*_id` field of the payload whose value is a
    /// string (or array of strings) becomes a scope entry.
    fn row_scopes(&self, row_json: &Value) -> ScopeMap {
        let mut out = ScopeMap::new();
        let Some(obj) = row_json.as_object() else {
            return out;
        };
        for (k, v) in obj {
            if !k.ends_with("_id") {
                continue;
            }
            match v {
                Value::String(s) => {
                    out.insert(k.clone(), syncular_schemas::ScopeValue::One(s.clone()));
                }
                Value::Array(arr) => {
                    let vals: Vec<String> = arr
                        .iter()
                        .filter_map(|x| x.as_str().map(|s| s.to_string()))
                        .collect();
                    if !vals.is_empty() {
                        out.insert(k.clone(), syncular_schemas::ScopeValue::Many(vals));
                    }
                }
                _ => {}
            }
        }
        out
    }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn TableHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TableHandler>) {
        self.handlers.insert(handler.table().to_string(), handler);
    }

    pub fn get(&self, table: &str) -> Option<&Arc<dyn TableHandler>> {
        self.handlers.get(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &Arc<dyn TableHandler>)> {
        self.handlers.iter().map(|(t, h)| (t.as_str(), h))
    }
}

// ---------------------------------------------------------------------------
// Default handler
// ---------------------------------------------------------------------------

/// Grants exactly what the principal's key carries:
/// - admin keys (empty scope set) get every requested scope;
/// - otherwise the requested keys must be a subset of the principal's keys.
///   No overlap at all reads as revocation, partial overlap as denial.
pub struct PrincipalScopeHandler {
    table: String,
    description: Option<String>,
}

impl PrincipalScopeHandler {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, d: impl Into<String>) -> Self {
        self.description = Some(d.into());
        self
    }
}

#[async_trait]
impl TableHandler for PrincipalScopeHandler {
    fn table(&self) -> &str {
        &self.table
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    async fn resolve_scopes(
        &self,
        principal: &Principal,
        requested: &ScopeMap,
        _params: Option<&Value>,
    ) -> ScopeResolution {
        let requested_keys = scope_keys_from_map(requested);

        if principal.scope_keys.is_empty() {
            return ScopeResolution::Granted(requested_keys);
        }

        let allowed: BTreeSet<ScopeKey> = principal
            .scope_keys
            .iter()
            .filter_map(|s| ScopeKey::parse(s))
            .collect();

        if requested_keys.is_empty() {
            // Subscribe-to-everything-you-have shorthand.
            return ScopeResolution::Granted(allowed);
        }

        let overlap: BTreeSet<ScopeKey> =
            requested_keys.intersection(&allowed).cloned().collect();

        if overlap.is_empty() {
            ScopeResolution::Revoked
        } else if overlap.len() == requested_keys.len() {
            ScopeResolution::Granted(requested_keys)
        } else {
            ScopeResolution::Denied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncular_schemas::{ApiKeyType, ScopeValue};

    fn principal_with(keys: &[&str]) -> Principal {
        Principal {
            actor_id: "a1".into(),
            key_type: ApiKeyType::Proxy,
            scope_keys: keys.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn requested(key: &str, value: &str) -> ScopeMap {
        let mut m = ScopeMap::new();
        m.insert(key.into(), ScopeValue::One(value.into()));
        m
    }

    #[tokio::test]
    async fn admin_gets_requested_scopes() {
        let h = PrincipalScopeHandler::new("tasks");
        let p = Principal::admin("ops");
        match h.resolve_scopes(&p, &requested("user_id", "u1"), None).await {
            ScopeResolution::Granted(keys) => {
                assert_eq!(keys.iter().next().unwrap().as_str(), "user:u1")
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subset_granted_disjoint_revoked_partial_denied() {
        let h = PrincipalScopeHandler::new("tasks");
        let p = principal_with(&["user:u1"]);

        assert!(matches!(
            h.resolve_scopes(&p, &requested("user_id", "u1"), None).await,
            ScopeResolution::Granted(_)
        ));
        assert_eq!(
            h.resolve_scopes(&p, &requested("user_id", "u2"), None).await,
            ScopeResolution::Revoked
        );

        let mut partial = ScopeMap::new();
        partial.insert(
            "user_id".into(),
            ScopeValue::Many(vec!["u1".into(), "u2".into()]),
        );
        assert_eq!(
            h.resolve_scopes(&p, &partial, None).await,
            ScopeResolution::Denied
        );
    }
}
