//! Propagation of policy objects from a parent namespace into its
//! child. Six flags cover seven kinds (the rbac flag carries Role and
//! RoleBinding together). Copies are stamped with the generated label;
//! the child-side listing selects on that label, so objects created
//! directly in the child are never touched.

use std::collections::BTreeSet;
use std::fmt::Debug;

use k8s_openapi::api::core::v1::{ConfigMap, LimitRange, Secret, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::crd::labels;

/// A namespaced kind whose objects can be mirrored into a child
/// namespace. `same_payload` compares the fields inheritance cares
/// about; `adopt_payload` copies them onto a stale child object.
pub trait Inheritable:
    Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn same_payload(&self, other: &Self) -> bool;
    fn adopt_payload(&mut self, source: &Self);

    /// Objects that must never leave their namespace, like
    /// service-account token secrets.
    fn portable(&self) -> bool {
        true
    }
}

impl Inheritable for Role {
    fn same_payload(&self, other: &Self) -> bool {
        self.rules == other.rules
    }
    fn adopt_payload(&mut self, source: &Self) {
        self.rules = source.rules.clone();
    }
}

impl Inheritable for RoleBinding {
    fn same_payload(&self, other: &Self) -> bool {
        self.role_ref == other.role_ref && self.subjects == other.subjects
    }
    fn adopt_payload(&mut self, source: &Self) {
        self.role_ref = source.role_ref.clone();
        self.subjects = source.subjects.clone();
    }
}

impl Inheritable for NetworkPolicy {
    fn same_payload(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
    fn adopt_payload(&mut self, source: &Self) {
        self.spec = source.spec.clone();
    }
}

impl Inheritable for LimitRange {
    fn same_payload(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
    fn adopt_payload(&mut self, source: &Self) {
        self.spec = source.spec.clone();
    }
}

impl Inheritable for Secret {
    fn same_payload(&self, other: &Self) -> bool {
        self.type_ == other.type_
            && self.data == other.data
            && self.string_data == other.string_data
            && self.immutable == other.immutable
    }
    fn adopt_payload(&mut self, source: &Self) {
        self.type_ = source.type_.clone();
        self.data = source.data.clone();
        self.string_data = source.string_data.clone();
        self.immutable = source.immutable;
    }
    fn portable(&self) -> bool {
        self.type_.as_deref() != Some("kubernetes.io/service-account-token")
    }
}

impl Inheritable for ConfigMap {
    fn same_payload(&self, other: &Self) -> bool {
        self.data == other.data
            && self.binary_data == other.binary_data
            && self.immutable == other.immutable
    }
    fn adopt_payload(&mut self, source: &Self) {
        self.data = source.data.clone();
        self.binary_data = source.binary_data.clone();
        self.immutable = source.immutable;
    }
}

impl Inheritable for ServiceAccount {
    fn same_payload(&self, other: &Self) -> bool {
        self.automount_service_account_token
            == other.automount_service_account_token
            && self.image_pull_secrets == other.image_pull_secrets
            && self.secrets == other.secrets
    }
    fn adopt_payload(&mut self, source: &Self) {
        self.automount_service_account_token =
            source.automount_service_account_token;
        self.image_pull_secrets = source.image_pull_secrets.clone();
        self.secrets = source.secrets.clone();
    }
}

/// Rewrite a parent object into the shape to be applied in the child:
/// server-populated metadata dropped, namespace retargeted, labels kept
/// with the generated marker added.
pub fn prepare_for_child<K: Inheritable>(source: &K, child_ns: &str) -> K {
    let mut copy = source.clone();
    {
        let meta = copy.meta_mut();
        meta.namespace = Some(child_ns.to_string());
        meta.uid = None;
        meta.resource_version = None;
        meta.creation_timestamp = None;
        meta.managed_fields = None;
        meta.owner_references = None;
        meta.generation = None;
        let mut lbl = meta.labels.take().unwrap_or_default();
        lbl.insert(labels::GENERATED.to_string(), "true".to_string());
        meta.labels = Some(lbl);
    }
    copy
}

/// What one pass over a kind has to do to make the child mirror the
/// parent.
#[derive(Debug)]
pub struct InheritancePlan<K> {
    pub create: Vec<K>,
    pub update: Vec<K>,
    pub delete: Vec<String>,
}

impl<K> InheritancePlan<K> {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Diff parent objects against the generated objects already in the
/// child, keyed by name. `child_objs` must already be filtered to
/// generated ones; anything else in the child namespace is invisible
/// here and therefore never deleted.
pub fn diff<K: Inheritable>(
    parent_objs: &[K],
    child_objs: &[K],
    child_ns: &str,
) -> InheritancePlan<K> {
    let mut plan = InheritancePlan {
        create: Vec::new(),
        update: Vec::new(),
        delete: Vec::new(),
    };

    let mut parent_names: BTreeSet<String> = BTreeSet::new();
    for source in parent_objs {
        if !source.portable() {
            continue;
        }
        let name = source.name_any();
        parent_names.insert(name.clone());
        match child_objs.iter().find(|c| c.name_any() == name) {
            None => plan.create.push(prepare_for_child(source, child_ns)),
            Some(existing) if !existing.same_payload(source) => {
                let mut updated = existing.clone();
                updated.adopt_payload(source);
                plan.update.push(updated);
            }
            Some(_) => {}
        }
    }

    for stale in child_objs {
        if !parent_names.contains(&stale.name_any()) {
            plan.delete.push(stale.name_any());
        }
    }

    plan
}

fn generated_selector() -> String {
    format!("{}=true", labels::GENERATED)
}

/// Mirror one kind from parent to child. Individual apply failures are
/// logged and reported through the returned flag so the caller can
/// park the object in the in-progress state; only listing failures
/// abort the pass.
pub async fn mirror<K: Inheritable>(
    client: &Client,
    parent_ns: &str,
    child_ns: &str,
) -> Result<bool, kube::Error> {
    let parent_api: Api<K> = Api::namespaced(client.clone(), parent_ns);
    let child_api: Api<K> = Api::namespaced(client.clone(), child_ns);

    let parent_objs = parent_api.list(&ListParams::default()).await?.items;
    let child_objs = child_api
        .list(&ListParams::default().labels(&generated_selector()))
        .await?
        .items;

    let plan = diff(&parent_objs, &child_objs, child_ns);
    let mut done = true;

    for obj in &plan.create {
        match child_api.create(&PostParams::default(), obj).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(e) => {
                warn!(error = %e, ns = child_ns, name = %obj.name_any(), "inheritance create failed");
                done = false;
            }
        }
    }
    for obj in &plan.update {
        if let Err(e) = child_api
            .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(obj))
            .await
        {
            warn!(error = %e, ns = child_ns, name = %obj.name_any(), "inheritance update failed");
            done = false;
        }
    }
    for name in &plan.delete {
        match child_api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => {
                warn!(error = %e, ns = child_ns, name = %name, "inheritance delete failed");
                done = false;
            }
        }
    }

    Ok(done)
}

/// Remove every generated object of one kind from the child, used when
/// the corresponding flag is switched off.
pub async fn revoke<K: Inheritable>(
    client: &Client,
    child_ns: &str,
) -> Result<(), kube::Error> {
    let child_api: Api<K> = Api::namespaced(client.clone(), child_ns);
    child_api
        .delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(&generated_selector()),
        )
        .await?;
    Ok(())
}

/// The closed set of inheritable concerns, keyed by the flag names the
/// SubNamespace spec uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InheritedKind {
    Rbac,
    NetworkPolicy,
    LimitRange,
    Secret,
    ConfigMap,
    ServiceAccount,
}

impl InheritedKind {
    pub const ALL: [InheritedKind; 6] = [
        InheritedKind::Rbac,
        InheritedKind::NetworkPolicy,
        InheritedKind::LimitRange,
        InheritedKind::Secret,
        InheritedKind::ConfigMap,
        InheritedKind::ServiceAccount,
    ];

    pub fn flag(&self) -> &'static str {
        match self {
            InheritedKind::Rbac => "rbac",
            InheritedKind::NetworkPolicy => "networkpolicy",
            InheritedKind::LimitRange => "limitrange",
            InheritedKind::Secret => "secret",
            InheritedKind::ConfigMap => "configmap",
            InheritedKind::ServiceAccount => "serviceaccount",
        }
    }

    pub async fn mirror(
        &self,
        client: &Client,
        parent_ns: &str,
        child_ns: &str,
    ) -> Result<bool, kube::Error> {
        Ok(match self {
            InheritedKind::Rbac => {
                mirror::<Role>(client, parent_ns, child_ns).await?
                    && mirror::<RoleBinding>(client, parent_ns, child_ns).await?
            }
            InheritedKind::NetworkPolicy => {
                mirror::<NetworkPolicy>(client, parent_ns, child_ns).await?
            }
            InheritedKind::LimitRange => {
                mirror::<LimitRange>(client, parent_ns, child_ns).await?
            }
            InheritedKind::Secret => {
                mirror::<Secret>(client, parent_ns, child_ns).await?
            }
            InheritedKind::ConfigMap => {
                mirror::<ConfigMap>(client, parent_ns, child_ns).await?
            }
            InheritedKind::ServiceAccount => {
                mirror::<ServiceAccount>(client, parent_ns, child_ns).await?
            }
        })
    }

    pub async fn revoke(
        &self,
        client: &Client,
        child_ns: &str,
    ) -> Result<(), kube::Error> {
        match self {
            InheritedKind::Rbac => {
                revoke::<Role>(client, child_ns).await?;
                revoke::<RoleBinding>(client, child_ns).await?;
            }
            InheritedKind::NetworkPolicy => {
                revoke::<NetworkPolicy>(client, child_ns).await?
            }
            InheritedKind::LimitRange => {
                revoke::<LimitRange>(client, child_ns).await?
            }
            InheritedKind::Secret => revoke::<Secret>(client, child_ns).await?,
            InheritedKind::ConfigMap => {
                revoke::<ConfigMap>(client, child_ns).await?
            }
            InheritedKind::ServiceAccount => {
                revoke::<ServiceAccount>(client, child_ns).await?
            }
        }
        Ok(())
    }
}
