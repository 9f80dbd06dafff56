//! Collision guard: a derived child name may already be taken. The
//! child is ours only if it carries our generated label and an owner
//! reference pointing back at the claiming SubNamespace.

use kube::api::ObjectMeta;

use crate::crd::labels;
use crate::crd::subnamespace::SubNamespace;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// No object under the derived name; safe to create.
    Absent,
    /// Exists and is owned by this SubNamespace.
    Owned,
    /// Exists but belongs to someone else. Permanent until an operator
    /// intervenes.
    Collision(String),
}

/// Decide whether `existing` (the object found under the derived child
/// name, if any) belongs to `parent`.
pub fn check_child_ownership(
    existing: Option<&ObjectMeta>,
    parent: &SubNamespace,
) -> Ownership {
    let Some(meta) = existing else {
        return Ownership::Absent;
    };

    let generated = meta
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::GENERATED))
        .is_some_and(|v| v == "true");
    if !generated {
        return Ownership::Collision(
            "an object outside this controller's management holds the derived name"
                .to_string(),
        );
    }

    let parent_uid = parent.metadata.uid.as_deref();
    let parent_name = parent.metadata.name.as_deref();
    let owned = meta.owner_references.as_deref().unwrap_or(&[]).iter().any(
        |or| {
            or.kind == "SubNamespace"
                && Some(or.uid.as_str()) == parent_uid
                && Some(or.name.as_str()) == parent_name
        },
    );
    if owned {
        Ownership::Owned
    } else {
        Ownership::Collision(
            "the derived name is held by another SubNamespace".to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::subnamespace::{SubNamespaceSpec, Workspace};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::collections::BTreeMap;

    fn parent(uid: &str) -> SubNamespace {
        SubNamespace {
            metadata: ObjectMeta {
                name: Some("team".to_string()),
                namespace: Some("acme".to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: SubNamespaceSpec {
                workspace: Some(Workspace {
                    resource_allocation: BTreeMap::new(),
                    inheritance: BTreeMap::new(),
                    scope: None,
                    sync: false,
                    owner: None,
                    slice_claim: None,
                }),
                subtenant: None,
                expiry: None,
            },
            status: None,
        }
    }

    fn child_meta(
        generated: bool,
        owner: Option<(&str, &str)>,
    ) -> ObjectMeta {
        ObjectMeta {
            name: Some("team-abc123".to_string()),
            labels: generated.then(|| {
                BTreeMap::from([(
                    labels::GENERATED.to_string(),
                    "true".to_string(),
                )])
            }),
            owner_references: owner.map(|(name, uid)| {
                vec![OwnerReference {
                    api_version: "core.edge-net.io/v1alpha1".to_string(),
                    kind: "SubNamespace".to_string(),
                    name: name.to_string(),
                    uid: uid.to_string(),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }
    }

    #[test]
    fn absent_when_no_object() {
        assert_eq!(
            check_child_ownership(None, &parent("u1")),
            Ownership::Absent
        );
    }

    #[test]
    fn owned_when_label_and_owner_ref_match() {
        let meta = child_meta(true, Some(("team", "u1")));
        assert_eq!(
            check_child_ownership(Some(&meta), &parent("u1")),
            Ownership::Owned
        );
    }

    #[test]
    fn collision_without_generated_label() {
        let meta = child_meta(false, Some(("team", "u1")));
        assert!(matches!(
            check_child_ownership(Some(&meta), &parent("u1")),
            Ownership::Collision(_)
        ));
    }

    #[test]
    fn collision_when_owner_uid_differs() {
        let meta = child_meta(true, Some(("team", "other-uid")));
        assert!(matches!(
            check_child_ownership(Some(&meta), &parent("u1")),
            Ownership::Collision(_)
        ));
    }

    #[test]
    fn collision_when_no_owner_refs() {
        let meta = child_meta(true, None);
        assert!(matches!(
            check_child_ownership(Some(&meta), &parent("u1")),
            Ownership::Collision(_)
        ));
    }
}
