//! Test support for the sync core: an in-memory [`Storage`] implementation
//! with the same contract as the Postgres gateway, plus small fixture
//! helpers. Scenario tests across the workspace run against this so no test
//! needs a live database.

use syncular_schemas::{Principal, PushOperation, ScopeMap, ScopeValue};

pub mod mem;

pub use mem::MemStorage;

/// Principal with explicit scope keys (`prefix:value` strings).
pub fn principal(actor_id: &str, scope_keys: &[&str]) -> Principal {
    Principal {
        actor_id: actor_id.to_string(),
        key_type: syncular_schemas::ApiKeyType::Proxy,
        scope_keys: scope_keys.iter().map(|s| s.to_string()).collect(),
    }
}

/// Single-entry scope map, e.g. `scopes_one("user_id", "u1")`.
pub fn scopes_one(key: &str, value: &str) -> ScopeMap {
    let mut m = ScopeMap::new();
    m.insert(key.to_string(), ScopeValue::One(value.to_string()));
    m
}

/// Upsert operation with a trivial payload.
pub fn upsert_op(table: &str, row_id: &str) -> PushOperation {
    PushOperation {
        table: table.to_string(),
        row_id: row_id.to_string(),
        op: syncular_schemas::ChangeOp::Upsert,
        payload: serde_json::json!({ "id": row_id }),
        row_version: None,
    }
}
