use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Contact, name_digest};

/// Lifecycle states written to `status.state`. The sequence
/// Partitioned -> Created -> Set -> Established is monotone within a
/// successful pass; Failure and Reconciliation are re-entry points.
pub const STATE_ESTABLISHED: &str = "Established";
pub const STATE_QUOTA_SET: &str = "Set";
pub const STATE_CREATED: &str = "Created";
pub const STATE_PARTITIONED: &str = "Partitioned";
pub const STATE_FAILED: &str = "Failure";
pub const STATE_RECONCILIATION: &str = "Reconciliation";

/// Consecutive failed passes after which the controller cleans the
/// child up and stops retrying.
pub const BACKOFF_LIMIT: u32 = 3;

/// A subsidiary namespace: carves a slice of the parent namespace's
/// resource budget into either a child namespace of the same tenant
/// (workspace) or a freshly registered tenant (subtenant). Exactly one
/// of `workspace` and `subtenant` must be set.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "core.edge-net.io",
    version = "v1alpha1",
    kind = "SubNamespace",
    plural = "subnamespaces",
    shortname = "snm",
    namespaced,
    status = "SubNamespaceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SubNamespaceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<Workspace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtenant: Option<Subtenant>,
    /// When set, the whole subtree is torn down at this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct Workspace {
    /// Resource demand charged against the parent budget.
    #[serde(default, rename = "resourceallocation")]
    pub resource_allocation: BTreeMap<String, Quantity>,
    /// Which kinds to propagate from parent to child, keyed by flag
    /// name (rbac, networkpolicy, limitrange, secret, configmap,
    /// serviceaccount).
    #[serde(default)]
    pub inheritance: BTreeMap<String, bool>,
    /// "local" (default) or "federation"; federation-scoped children
    /// get the cluster UID prefixed into their derived name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Re-apply inheritance periodically instead of only on change.
    #[serde(default)]
    pub sync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Contact>,
    /// Name of a SliceClaim in the parent namespace; when bound, the
    /// slice's node capacity replaces `resourceallocation`.
    #[serde(default, rename = "sliceclaim", skip_serializing_if = "Option::is_none")]
    pub slice_claim: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct Subtenant {
    #[serde(default, rename = "resourceallocation")]
    pub resource_allocation: BTreeMap<String, Quantity>,
    pub owner: Contact,
    #[serde(default, rename = "sliceclaim", skip_serializing_if = "Option::is_none")]
    pub slice_claim: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubNamespaceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Consecutive failed passes; resets on success, pinned at
    /// `BACKOFF_LIMIT - 1` on an ownership collision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<u32>,
    /// Derived name of the child object once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<String>,
}

/// Which of the two modes a SubNamespace runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnmMode {
    Workspace,
    Subtenant,
}

impl SnmMode {
    /// Value of the `edge-net.io/kind` label on the child namespace,
    /// and the prefix of the parent-side quota object name.
    pub fn quota_kind(&self) -> &'static str {
        match self {
            SnmMode::Workspace => "sub",
            SnmMode::Subtenant => "core",
        }
    }
}

impl SubNamespace {
    /// Mode of this object; `None` when the spec sets neither or both
    /// arms (rejected as a permanent failure).
    pub fn mode(&self) -> Option<SnmMode> {
        match (&self.spec.workspace, &self.spec.subtenant) {
            (Some(_), None) => Some(SnmMode::Workspace),
            (None, Some(_)) => Some(SnmMode::Subtenant),
            _ => None,
        }
    }

    pub fn resource_allocation(&self) -> &BTreeMap<String, Quantity> {
        static EMPTY: BTreeMap<String, Quantity> = BTreeMap::new();
        match (&self.spec.workspace, &self.spec.subtenant) {
            (Some(w), _) => &w.resource_allocation,
            (_, Some(s)) => &s.resource_allocation,
            _ => &EMPTY,
        }
    }

    pub fn slice_claim(&self) -> Option<&str> {
        match (&self.spec.workspace, &self.spec.subtenant) {
            (Some(w), _) => w.slice_claim.as_deref(),
            (_, Some(s)) => s.slice_claim.as_deref(),
            _ => None,
        }
    }

    pub fn owner_contact(&self) -> Option<&Contact> {
        match (&self.spec.workspace, &self.spec.subtenant) {
            (Some(w), _) => w.owner.as_ref(),
            (_, Some(s)) => Some(&s.owner),
            _ => None,
        }
    }

    pub fn sync_enabled(&self) -> bool {
        self.spec.workspace.as_ref().is_some_and(|w| w.sync)
    }

    pub fn inheritance_flag(&self, key: &str) -> bool {
        self.spec
            .workspace
            .as_ref()
            .and_then(|w| w.inheritance.get(key))
            .copied()
            .unwrap_or(false)
    }

    /// Deterministic child identity: the object name, prefixed with
    /// the cluster UID for federation-scoped workspaces, suffixed with
    /// the digest of `{namespace}-{name}`. Pure so that replays and
    /// collision checks agree.
    pub fn child_name(&self, cluster_uid: &str) -> Option<String> {
        let namespace = self.metadata.namespace.as_deref()?;
        let name = self.metadata.name.as_deref()?;
        let base = match &self.spec.workspace {
            Some(w) if w.scope.as_deref() == Some("federation") => {
                format!("{cluster_uid}-{name}")
            }
            _ => name.to_string(),
        };
        let digest = name_digest(namespace, &base);
        Some(format!("{base}-{digest}"))
    }

    pub fn state(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.state.as_deref())
    }

    pub fn failed_count(&self) -> u32 {
        self.status
            .as_ref()
            .and_then(|s| s.failed)
            .unwrap_or(0)
    }

    /// Active means the object still holds a slice of the parent
    /// budget: any state except exhausted Failure.
    pub fn is_active(&self) -> bool {
        !(self.state() == Some(STATE_FAILED)
            && self.failed_count() >= BACKOFF_LIMIT)
    }

    /// Whether the claim has reached an in-progress or established
    /// state. Only such claims yield under budget pressure.
    pub fn has_progressed(&self) -> bool {
        matches!(
            self.state(),
            Some(
                STATE_PARTITIONED
                    | STATE_CREATED
                    | STATE_QUOTA_SET
                    | STATE_ESTABLISHED
                    | STATE_RECONCILIATION
            )
        )
    }

    pub fn expiry(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.spec.expiry.as_ref().map(|t| t.0)
    }
}
