//! Tenant eligibility and RBAC grants for objects this controller
//! creates on behalf of a tenant.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use thiserror::Error;

use crate::crd::labels;
use crate::crd::tenant::Tenant;

/// ClusterRole granting full control over one's own tenant; bound into
/// each workspace for its owner.
pub const TENANT_OWNER_CLUSTER_ROLE: &str = "edgenet:tenant-owner";
pub const WORKSPACE_OWNER_BINDING: &str = "edgenet:workspace:owner";
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

#[derive(Debug, Error)]
pub enum AccessErr {
    /// Permanent: the object sits outside an eligible tenant boundary.
    #[error("ineligible: {0}")]
    Ineligible(String),
    #[error(transparent)]
    Api(#[from] kube::Error),
}

/// What the eligibility check establishes about the parent namespace.
#[derive(Clone, Debug)]
pub struct Eligibility {
    /// UID of the kube-system namespace, the cluster's identity.
    pub cluster_uid: String,
    pub tenant: Tenant,
    pub parent_labels: BTreeMap<String, String>,
}

/// Validate that `parent_ns` belongs to an enabled tenant of this
/// cluster. The tenant named by the namespace labels must exist, be
/// enabled, and carry the UID the labels claim.
pub async fn eligibility_check(
    client: &Client,
    parent_ns: &str,
) -> Result<Eligibility, AccessErr> {
    let namespaces: Api<Namespace> = Api::all(client.clone());

    let kube_system = namespaces.get("kube-system").await?;
    let cluster_uid = kube_system
        .metadata
        .uid
        .ok_or_else(|| AccessErr::Ineligible("cluster identity unavailable".into()))?;

    let parent = namespaces.get(parent_ns).await?;
    let parent_labels = parent.metadata.labels.unwrap_or_default();

    if let Some(claimed_cluster) = parent_labels.get(labels::CLUSTER_UID) {
        if *claimed_cluster != cluster_uid {
            return Err(AccessErr::Ineligible(format!(
                "namespace {parent_ns} belongs to another cluster"
            )));
        }
    }

    let tenant_name = parent_labels
        .get(labels::TENANT)
        .ok_or_else(|| {
            AccessErr::Ineligible(format!(
                "namespace {parent_ns} is not part of a tenant"
            ))
        })?
        .clone();
    let claimed_uid = parent_labels.get(labels::TENANT_UID).cloned();

    let tenants: Api<Tenant> = Api::all(client.clone());
    let tenant = tenants.get(&tenant_name).await?;

    if !tenant.spec.enabled {
        return Err(AccessErr::Ineligible(format!(
            "tenant {tenant_name} is disabled"
        )));
    }
    if tenant.metadata.uid != claimed_uid {
        return Err(AccessErr::Ineligible(format!(
            "namespace {parent_ns} carries a stale tenant identity"
        )));
    }

    Ok(Eligibility {
        cluster_uid,
        tenant,
        parent_labels,
    })
}

fn generated_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(labels::GENERATED.to_string(), "true".to_string())])
}

/// Name of the object-specific owner ClusterRole and its binding.
pub fn owner_role_name(resource: &str, resource_name: &str) -> String {
    format!("edgenet:{resource}:{resource_name}-owner")
}

/// Grant `email` ownership of one named object: a ClusterRole scoped
/// to that resource name (get/update/patch/delete plus status reads)
/// and a ClusterRoleBinding to the user. Both are generated-labeled
/// and owner-referenced for traceability; the garbage collector does
/// not honor a namespaced owner on cluster-scoped dependents, so the
/// pair is removed explicitly via `revoke_object_ownership` at
/// teardown.
pub async fn grant_object_ownership(
    client: &Client,
    api_group: &str,
    resource: &str,
    resource_name: &str,
    email: &str,
    owner_ref: OwnerReference,
) -> Result<(), kube::Error> {
    let name = owner_role_name(resource, resource_name);
    let meta = ObjectMeta {
        name: Some(name.clone()),
        labels: Some(generated_labels()),
        owner_references: Some(vec![owner_ref]),
        ..Default::default()
    };

    let role = ClusterRole {
        metadata: meta.clone(),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![api_group.to_string()]),
                resources: Some(vec![resource.to_string()]),
                resource_names: Some(vec![resource_name.to_string()]),
                verbs: ["get", "update", "patch", "delete"]
                    .iter()
                    .map(|v| v.to_string())
                    .collect(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![api_group.to_string()]),
                resources: Some(vec![format!("{resource}/status")]),
                resource_names: Some(vec![resource_name.to_string()]),
                verbs: ["get", "list", "watch"]
                    .iter()
                    .map(|v| v.to_string())
                    .collect(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let binding = ClusterRoleBinding {
        metadata: meta,
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            api_group: Some(RBAC_API_GROUP.to_string()),
            kind: "User".to_string(),
            name: email.to_string(),
            namespace: None,
        }]),
    };

    let roles: Api<ClusterRole> = Api::all(client.clone());
    create_or_update(&roles, &name, role).await?;
    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    create_or_update(&bindings, &name, binding).await?;
    Ok(())
}

/// Remove the object-scoped grant pair. Cluster-scoped, so never
/// collected off the owning object's deletion; called during teardown.
pub async fn revoke_object_ownership(
    client: &Client,
    resource: &str,
    resource_name: &str,
) -> Result<(), kube::Error> {
    let name = owner_role_name(resource, resource_name);
    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    match bindings.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e),
    }
    let roles: Api<ClusterRole> = Api::all(client.clone());
    match roles.delete(&name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e),
    }
}

/// Bind the workspace owner into the child namespace with the shared
/// tenant-owner ClusterRole.
pub async fn ensure_workspace_owner_binding(
    client: &Client,
    child_ns: &str,
    email: &str,
) -> Result<(), kube::Error> {
    let binding = RoleBinding {
        metadata: ObjectMeta {
            name: Some(WORKSPACE_OWNER_BINDING.to_string()),
            namespace: Some(child_ns.to_string()),
            labels: Some(generated_labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: TENANT_OWNER_CLUSTER_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            api_group: Some(RBAC_API_GROUP.to_string()),
            kind: "User".to_string(),
            name: email.to_string(),
            namespace: None,
        }]),
    };
    let api: Api<RoleBinding> = Api::namespaced(client.clone(), child_ns);
    create_or_update(&api, WORKSPACE_OWNER_BINDING, binding).await
}

/// Drop the owner binding when the workspace no longer names an owner.
pub async fn remove_workspace_owner_binding(
    client: &Client,
    child_ns: &str,
) -> Result<(), kube::Error> {
    let api: Api<RoleBinding> = Api::namespaced(client.clone(), child_ns);
    match api
        .delete(WORKSPACE_OWNER_BINDING, &DeleteParams::default())
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create, or merge-patch the desired shape over an existing object.
pub async fn create_or_update<K>(
    api: &Api<K>,
    name: &str,
    desired: K,
) -> Result<(), kube::Error>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::Serialize,
    K: serde::de::DeserializeOwned,
{
    match api.create(&PostParams::default(), &desired).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            api.patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(&desired),
            )
            .await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_role_name_shape() {
        assert_eq!(
            owner_role_name("subnamespaces", "team-1a2b3c4d"),
            "edgenet:subnamespaces:team-1a2b3c4d-owner"
        );
    }
}
