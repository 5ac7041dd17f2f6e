//! Merge helpers shared by every aggregated view: paged fetch, stable
//! ordering, and federated-id tagging. Generalised over JSON items so each
//! endpoint only declares where its timestamp and local id live.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use syncular_schemas::FailedInstance;

/// One downstream list item, lifted out of its page with enough context to
/// sort and tag it.
#[derive(Debug, Clone)]
pub struct MergedItem {
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    pub local_id: String,
    pub value: Value,
}

/// Ordering contract for every merged list: timestamp descending, ties by
/// instance id ascending, then by local id descending (numeric-aware so
/// commit seq 10 sorts above 9).
pub fn merge_sorted(mut items: Vec<MergedItem>) -> Vec<MergedItem> {
    items.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.instance_id.cmp(&b.instance_id))
            .then_with(|| compare_local_ids(&b.local_id, &a.local_id))
    });
    items
}

fn compare_local_ids(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

pub fn paginate(items: Vec<MergedItem>, offset: usize, limit: usize) -> Vec<MergedItem> {
    items.into_iter().skip(offset).take(limit).collect()
}

/// Extract the first present field as an RFC 3339 timestamp.
pub fn extract_timestamp(value: &Value, fields: &[&str]) -> Option<DateTime<Utc>> {
    fields.iter().find_map(|f| {
        value
            .get(f)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
    })
}

/// Extract the first present field as a string id (numbers are rendered).
pub fn extract_local_id(value: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|f| match value.get(f) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Tag a merged item with its origin: `instanceId`, a
/// `federated<Entity>Id = "<instance>:<local>"`, and the original local id
/// mirrored under `local_out_field` (numeric stays numeric).
pub fn tag_federated(
    value: &mut Value,
    instance_id: &str,
    local_id: &str,
    federated_field: &str,
    local_source_field: &str,
    local_out_field: &str,
) {
    if let Value::Object(map) = value {
        map.insert("instanceId".into(), json!(instance_id));
        map.insert(
            federated_field.into(),
            json!(format!("{instance_id}:{local_id}")),
        );
        let original = map
            .get(local_source_field)
            .cloned()
            .unwrap_or_else(|| json!(local_id));
        map.insert(local_out_field.into(), original);
    }
}

/// Attach the partial-failure envelope to a merged response body.
pub fn partial_failure_envelope(body: &mut Map<String, Value>, failed: &[FailedInstance]) {
    body.insert("partial".into(), json!(!failed.is_empty()));
    body.insert(
        "failedInstances".into(),
        serde_json::to_value(failed).unwrap_or(Value::Array(Vec::new())),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(instance: &str, ts: &str, local_id: &str) -> MergedItem {
        MergedItem {
            instance_id: instance.to_string(),
            timestamp: ts.parse().unwrap(),
            local_id: local_id.to_string(),
            value: json!({}),
        }
    }

    #[test]
    fn sorts_timestamp_desc_then_instance_asc_then_id_desc() {
        let merged = merge_sorted(vec![
            item("beta", "2026-01-01T10:03:00Z", "39"),
            item("alpha", "2026-01-01T10:04:00Z", "40"),
            item("beta", "2026-01-01T10:05:00Z", "2001"),
            item("alpha", "2026-01-01T10:04:00Z", "41"),
        ]);
        let order: Vec<(String, String)> = merged
            .into_iter()
            .map(|m| (m.instance_id, m.local_id))
            .collect();
        assert_eq!(
            order,
            vec![
                ("beta".to_string(), "2001".to_string()),
                ("alpha".to_string(), "41".to_string()),
                ("alpha".to_string(), "40".to_string()),
                ("beta".to_string(), "39".to_string()),
            ]
        );
    }

    #[test]
    fn numeric_ids_sort_numerically() {
        let merged = merge_sorted(vec![
            item("a", "2026-01-01T10:00:00Z", "9"),
            item("a", "2026-01-01T10:00:00Z", "10"),
        ]);
        assert_eq!(merged[0].local_id, "10");
    }

    #[test]
    fn tagging_adds_federated_and_local_ids() {
        let mut value = json!({ "commitSeq": 42, "createdAt": "2026-01-01T00:00:00Z" });
        tag_federated(
            &mut value,
            "alpha",
            "42",
            "federatedCommitId",
            "commitSeq",
            "localCommitSeq",
        );
        assert_eq!(value["instanceId"], "alpha");
        assert_eq!(value["federatedCommitId"], "alpha:42");
        assert_eq!(value["localCommitSeq"], 42);
    }
}
