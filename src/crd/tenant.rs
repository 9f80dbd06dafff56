//! Collaborator resources the subnamespace controller reads and, for
//! subtenants, creates: Tenant, TenantResourceQuota and SliceClaim.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Contact;
use crate::quota::{QuantityErr, quantity_millis};

pub const SLICE_BOUND: &str = "Bound";
pub const SLICE_EMPLOYED: &str = "Employed";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "core.edge-net.io",
    version = "v1alpha1",
    kind = "Tenant",
    plural = "tenants",
    status = "TenantStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    #[serde(rename = "fullname")]
    pub full_name: String,
    pub url: String,
    pub contact: Contact,
    /// Disabled tenants fail the eligibility check; their subsidiary
    /// namespaces stop reconciling.
    pub enabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A timed adjustment to a tenant's budget. Claims add, drops remove;
/// entries past their expiry no longer count.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTuning {
    #[serde(rename = "resourceList")]
    pub resource_list: BTreeMap<String, Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<Time>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "core.edge-net.io",
    version = "v1alpha1",
    kind = "TenantResourceQuota",
    plural = "tenantresourcequotas",
    shortname = "trq",
    status = "TenantResourceQuotaStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TenantResourceQuotaSpec {
    #[serde(default)]
    pub claim: BTreeMap<String, ResourceTuning>,
    #[serde(default)]
    pub drop: BTreeMap<String, ResourceTuning>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantResourceQuotaStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TenantResourceQuota {
    /// Net budget at `now`: unexpired claims summed, unexpired drops
    /// subtracted, in milli-units keyed by resource name.
    pub fn net_budget(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<BTreeMap<String, i128>, QuantityErr> {
        let mut assembled: BTreeMap<String, i128> = BTreeMap::new();
        for tuning in self.spec.claim.values() {
            if tuning.expiry.as_ref().is_some_and(|t| t.0 <= now) {
                continue;
            }
            for (resource, quantity) in &tuning.resource_list {
                *assembled.entry(resource.clone()).or_insert(0) +=
                    quantity_millis(quantity)?;
            }
        }
        for tuning in self.spec.drop.values() {
            if tuning.expiry.as_ref().is_some_and(|t| t.0 <= now) {
                continue;
            }
            for (resource, quantity) in &tuning.resource_list {
                *assembled.entry(resource.clone()).or_insert(0) -=
                    quantity_millis(quantity)?;
            }
        }
        Ok(assembled)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    pub count: u32,
}

/// A pre-reservation of nodes inside a tenant namespace. When a
/// SubNamespace references a bound claim, the claimed nodes' capacity
/// replaces the declared resource allocation.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "core.edge-net.io",
    version = "v1alpha1",
    kind = "SliceClaim",
    plural = "sliceclaims",
    namespaced,
    status = "SliceClaimStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SliceClaimSpec {
    #[serde(rename = "slicename")]
    pub slice_name: String,
    #[serde(rename = "nodeselector", default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<NodeSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SliceClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SliceClaim {
    pub fn is_bound(&self) -> bool {
        matches!(
            self.status.as_ref().and_then(|s| s.state.as_deref()),
            Some(SLICE_BOUND) | Some(SLICE_EMPLOYED)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use kube::api::ObjectMeta;

    fn tuning(pairs: &[(&str, &str)], expiry: Option<Time>) -> ResourceTuning {
        ResourceTuning {
            resource_list: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                .collect(),
            expiry,
        }
    }

    fn trq(
        claims: Vec<(&str, ResourceTuning)>,
        drops: Vec<(&str, ResourceTuning)>,
    ) -> TenantResourceQuota {
        TenantResourceQuota {
            metadata: ObjectMeta {
                name: Some("acme".to_string()),
                ..Default::default()
            },
            spec: TenantResourceQuotaSpec {
                claim: claims
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                drop: drops
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            },
            status: None,
        }
    }

    #[test]
    fn net_budget_sums_claims_minus_drops() {
        let q = trq(
            vec![
                ("initial", tuning(&[("cpu", "8"), ("memory", "8Gi")], None)),
                ("bonus", tuning(&[("cpu", "2")], None)),
            ],
            vec![("penalty", tuning(&[("cpu", "1")], None))],
        );
        let budget = q.net_budget(Utc::now()).unwrap();
        assert_eq!(budget["cpu"], 9_000);
        assert_eq!(budget["memory"], 8 * 1_000 * (1i128 << 30));
    }

    #[test]
    fn expired_entries_do_not_count() {
        let past = Time(Utc::now() - Duration::hours(1));
        let future = Time(Utc::now() + Duration::hours(1));
        let q = trq(
            vec![
                ("gone", tuning(&[("cpu", "4")], Some(past.clone()))),
                ("live", tuning(&[("cpu", "2")], Some(future))),
            ],
            vec![("stale-drop", tuning(&[("cpu", "2")], Some(past)))],
        );
        let budget = q.net_budget(Utc::now()).unwrap();
        assert_eq!(budget["cpu"], 2_000);
    }

    #[test]
    fn bound_covers_employed() {
        let mut sc = SliceClaim {
            metadata: ObjectMeta::default(),
            spec: SliceClaimSpec {
                slice_name: "s".to_string(),
                node_selector: None,
                expiry: None,
            },
            status: None,
        };
        assert!(!sc.is_bound());
        sc.status = Some(SliceClaimStatus {
            state: Some(SLICE_EMPLOYED.to_string()),
            message: None,
        });
        assert!(sc.is_bound());
    }
}
