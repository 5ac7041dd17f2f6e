//! Instance selection and federated-id handling.

use serde::Deserialize;

use syncular_config::{GatewayConfig, InstanceConfig};
use syncular_schemas::{ErrorCode, SyncError};

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSelector {
    pub instance_id: Option<String>,
    /// Comma-separated list.
    pub instance_ids: Option<String>,
}

impl InstanceSelector {
    fn requested(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(one) = &self.instance_id {
            if !one.is_empty() {
                out.push(one.clone());
            }
        }
        if let Some(many) = &self.instance_ids {
            out.extend(
                many.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }
        out
    }
}

/// Resolve the target set: an empty filter means every enabled instance; a
/// filter that matches nothing is an error.
pub fn select_instances<'a>(
    cfg: &'a GatewayConfig,
    selector: &InstanceSelector,
) -> Result<Vec<&'a InstanceConfig>, SyncError> {
    let enabled: Vec<&InstanceConfig> = cfg.instances.iter().filter(|i| i.enabled).collect();
    let requested = selector.requested();

    let selected: Vec<&InstanceConfig> = if requested.is_empty() {
        enabled
    } else {
        enabled
            .into_iter()
            .filter(|i| requested.contains(&i.instance_id))
            .collect()
    };

    if selected.is_empty() {
        return Err(SyncError::new(
            ErrorCode::NoInstancesSelected,
            "no enabled instance matches the selection",
        ));
    }
    Ok(selected)
}

/// Mutating and inherently single-instance endpoints need exactly one
/// target.
pub fn require_single<'a>(
    selected: Vec<&'a InstanceConfig>,
) -> Result<&'a InstanceConfig, SyncError> {
    if selected.len() != 1 {
        return Err(SyncError::new(
            ErrorCode::InstanceRequired,
            "this endpoint targets exactly one instance; pass instanceId=",
        ));
    }
    Ok(selected[0])
}

// ---------------------------------------------------------------------------
// Federated ids
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederatedId {
    pub instance_id: Option<String>,
    pub local_id: String,
}

/// `"<instanceId>:<localId>"`, or a bare local id (instance supplied via
/// query).
pub fn parse_federated_id(raw: &str) -> Result<FederatedId, SyncError> {
    match raw.split_once(':') {
        Some((instance, local)) => {
            if instance.is_empty() || local.is_empty() {
                return Err(SyncError::new(
                    ErrorCode::InvalidFederatedId,
                    format!("malformed federated id '{raw}'"),
                ));
            }
            Ok(FederatedId {
                instance_id: Some(instance.to_string()),
                local_id: local.to_string(),
            })
        }
        None if raw.is_empty() => Err(SyncError::new(
            ErrorCode::InvalidFederatedId,
            "empty federated id",
        )),
        None => Ok(FederatedId {
            instance_id: None,
            local_id: raw.to_string(),
        }),
    }
}

/// Resolve a parsed id against the configured instances. Bare ids need
/// either an explicit `instanceId=` or an unambiguous (single-instance)
/// deployment; `ambiguous_code` names the entity for the error.
pub fn resolve_federated<'a>(
    cfg: &'a GatewayConfig,
    id: &FederatedId,
    selector: &InstanceSelector,
    ambiguous_code: ErrorCode,
) -> Result<&'a InstanceConfig, SyncError> {
    let enabled: Vec<&InstanceConfig> = cfg.instances.iter().filter(|i| i.enabled).collect();

    let instance_id = id
        .instance_id
        .clone()
        .or_else(|| selector.instance_id.clone());

    match instance_id {
        Some(wanted) => enabled
            .into_iter()
            .find(|i| i.instance_id == wanted)
            .ok_or_else(|| {
                SyncError::new(
                    ErrorCode::NotFound,
                    format!("unknown instance '{wanted}'"),
                )
            }),
        None if enabled.len() == 1 => Ok(enabled[0]),
        None => Err(SyncError::new(
            ambiguous_code,
            "bare id is ambiguous across instances; pass instanceId=",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(ids: &[(&str, bool)]) -> GatewayConfig {
        GatewayConfig {
            instances: ids
                .iter()
                .map(|(id, enabled)| InstanceConfig {
                    instance_id: id.to_string(),
                    label: id.to_string(),
                    base_url: format!("http://{id}"),
                    token: None,
                    enabled: *enabled,
                })
                .collect(),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn empty_filter_selects_all_enabled() {
        let cfg = cfg(&[("alpha", true), ("beta", true), ("gamma", false)]);
        let selected = select_instances(&cfg, &InstanceSelector::default()).unwrap();
        let ids: Vec<&str> = selected.iter().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
    }

    #[test]
    fn zero_enabled_instances_is_an_error() {
        let cfg = cfg(&[("alpha", false)]);
        let err = select_instances(&cfg, &InstanceSelector::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoInstancesSelected);
    }

    #[test]
    fn comma_list_filters() {
        let cfg = cfg(&[("alpha", true), ("beta", true), ("gamma", true)]);
        let sel = InstanceSelector {
            instance_id: None,
            instance_ids: Some("alpha, gamma".to_string()),
        };
        let ids: Vec<String> = select_instances(&cfg, &sel)
            .unwrap()
            .iter()
            .map(|i| i.instance_id.clone())
            .collect();
        assert_eq!(ids, vec!["alpha", "gamma"]);
    }

    #[test]
    fn federated_id_forms() {
        assert_eq!(
            parse_federated_id("alpha:42").unwrap(),
            FederatedId {
                instance_id: Some("alpha".into()),
                local_id: "42".into()
            }
        );
        assert_eq!(
            parse_federated_id("42").unwrap(),
            FederatedId {
                instance_id: None,
                local_id: "42".into()
            }
        );
        assert!(parse_federated_id(":42").is_err());
        assert!(parse_federated_id("alpha:").is_err());
    }

    #[test]
    fn bare_id_needs_disambiguation_with_multiple_instances() {
        let cfg = cfg(&[("alpha", true), ("beta", true)]);
        let id = parse_federated_id("42").unwrap();
        let err = resolve_federated(
            &cfg,
            &id,
            &InstanceSelector::default(),
            ErrorCode::AmbiguousCommitId,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::AmbiguousCommitId);

        let sel = InstanceSelector {
            instance_id: Some("beta".into()),
            instance_ids: None,
        };
        let inst = resolve_federated(&cfg, &id, &sel, ErrorCode::AmbiguousCommitId).unwrap();
        assert_eq!(inst.instance_id, "beta");
    }

    #[test]
    fn unknown_federated_instance_is_not_found() {
        let cfg = cfg(&[("alpha", true)]);
        let id = parse_federated_id("zeta:42").unwrap();
        let err = resolve_federated(
            &cfg,
            &id,
            &InstanceSelector::default(),
            ErrorCode::AmbiguousCommitId,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }
}
