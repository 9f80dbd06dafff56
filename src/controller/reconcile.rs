//! One full, idempotent pass over a SubNamespace per wakeup: teardown
//! and expiry first, then eligibility, the collision guard, budget
//! partitioning, child creation, child quota sizing and inheritance.
//! Status is advanced at each stage boundary through a
//! resourceVersion-carrying replace, so a concurrent writer turns the
//! pass into a clean conflict retry instead of a lost update.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Namespace, Node, ResourceQuota, ResourceQuotaSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{
    Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams,
};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tokio::time::Duration;
use tracing::{instrument, warn};

use super::events::{
    REASON_COLLISION, REASON_EVICTED, REASON_EXPIRED, REASON_FORMED,
    REASON_INELIGIBLE, REASON_SHORTAGE, emit_event, emit_warning,
};
use super::inheritance::InheritedKind;
use super::ownership::{Ownership, check_child_ownership};
use super::{ControllerContext, FINALIZER, ReconcileErr};
use crate::access::{
    AccessErr, Eligibility, create_or_update, eligibility_check,
    ensure_workspace_owner_binding, grant_object_ownership,
    remove_workspace_owner_binding, revoke_object_ownership,
};
use crate::config::SnmConfig;
use crate::crd::subnamespace::{
    BACKOFF_LIMIT, STATE_CREATED, STATE_ESTABLISHED, STATE_FAILED,
    STATE_PARTITIONED, STATE_QUOTA_SET, STATE_RECONCILIATION, SnmMode,
    SubNamespace, SubNamespaceStatus,
};
use crate::crd::tenant::{
    SliceClaim, Tenant, TenantResourceQuota, TenantResourceQuotaSpec,
    TenantSpec, ResourceTuning,
};
use crate::crd::{GROUP, labels};
use crate::quota::{
    Partition, SiblingClaim, demand_millis, millis_to_quantities,
    partition_budget,
};

const NODE_SELECTOR_ANNOTATION: &str =
    "scheduler.alpha.kubernetes.io/node-selector";

#[instrument(skip(obj, ctx), fields(ns = ?obj.metadata.namespace, name = ?obj.metadata.name))]
pub async fn reconcile(
    obj: Arc<SubNamespace>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let ns = obj.namespace().ok_or_else(|| {
        ReconcileErr::Internal("subnamespace without a namespace".to_string())
    })?;
    let name = obj.name_any();
    let uid = obj.meta().uid.clone();
    let snm_api: Api<SubNamespace> = Api::namespaced(ctx.client.clone(), &ns);

    if obj.meta().deletion_timestamp.is_some() {
        return finalize(&obj, &ctx, &ns, &name).await;
    }

    // A subtree past its expiry is torn down whole: deleting the claim
    // cascades through the finalizer.
    if let Some(expiry) = obj.expiry() {
        if expiry <= Utc::now() {
            emit_warning(
                &ctx.recorder,
                &ns,
                &name,
                uid.as_deref(),
                REASON_EXPIRED,
                "Delete",
                Some("expiry reached; tearing the subtree down".to_string()),
            )
            .await;
            match snm_api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(Action::await_change());
        }
    }

    let mut current = (*obj).clone();

    let Some(mode) = obj.mode() else {
        // Malformed spec; nothing to retry until it is edited.
        advance(
            &snm_api,
            &mut current,
            STATE_FAILED,
            Some("exactly one of workspace and subtenant must be set".to_string()),
            Some(obj.failed_count().max(1)),
            None,
        )
        .await?;
        return Ok(Action::await_change());
    };

    // Backoff exhausted: release what the claim held, hand the budget
    // back, and go quiet. The object stays in Failure for inspection.
    if obj.state() == Some(STATE_FAILED) && obj.failed_count() >= BACKOFF_LIMIT {
        if let Err(e) = release_child(&obj, &ctx, &ns, mode).await {
            warn!(ns = %ns, name = %name, error = %e, "cleanup after exhausted backoff failed");
        }
        if let Err(e) = restitute_parent_quota(&obj, &ctx, &ns).await {
            warn!(ns = %ns, name = %name, error = %e, "budget restitution after exhausted backoff failed");
        }
        return Ok(Action::await_change());
    }

    ensure_finalizer(&snm_api, &obj).await?;

    let elig = match eligibility_check(&ctx.client, &ns).await {
        Ok(e) => e,
        Err(AccessErr::Ineligible(msg)) => {
            emit_warning(
                &ctx.recorder,
                &ns,
                &name,
                uid.as_deref(),
                REASON_INELIGIBLE,
                "Reconcile",
                Some(msg.clone()),
            )
            .await;
            return fail_pass(&snm_api, &mut current, &ctx, msg).await;
        }
        Err(AccessErr::Api(e)) => return Err(e.into()),
    };

    let child_name = obj.child_name(&elig.cluster_uid).ok_or_else(|| {
        ReconcileErr::Internal("object missing name or namespace".to_string())
    })?;

    // Collision guard before anything is created under the derived
    // name. A collision never self-heals; pinning the counter one
    // short of the limit keeps the child-cleanup branch away from an
    // object we do not own.
    let existing_meta = child_meta(&ctx.client, mode, &child_name).await?;
    match check_child_ownership(existing_meta.as_ref(), &obj) {
        Ownership::Collision(reason) => {
            emit_warning(
                &ctx.recorder,
                &ns,
                &name,
                uid.as_deref(),
                REASON_COLLISION,
                "Reconcile",
                Some(reason.clone()),
            )
            .await;
            advance(
                &snm_api,
                &mut current,
                STATE_FAILED,
                Some(reason),
                Some(BACKOFF_LIMIT - 1),
                None,
            )
            .await?;
            return Ok(Action::await_change());
        }
        Ownership::Absent | Ownership::Owned => {}
    }

    if let Some(contact) = obj.owner_contact() {
        grant_object_ownership(
            &ctx.client,
            GROUP,
            "subnamespaces",
            &name,
            &contact.email,
            owner_reference(&obj),
        )
        .await?;
    }

    let demand = match resolve_allocation(&ctx.client, &obj, &ns).await {
        Ok(ResolvedDemand::Demand(d)) => d,
        Ok(ResolvedDemand::Unresolvable(msg)) => {
            return fail_pass(&snm_api, &mut current, &ctx, msg).await;
        }
        Err(ReconcileErr::Quantity(q)) => {
            return fail_pass(
                &snm_api,
                &mut current,
                &ctx,
                format!("malformed resource allocation: {q}"),
            )
            .await;
        }
        Err(e) => return Err(e),
    };

    // Partition the scope budget among active siblings, this claim
    // included. No budget object means an unmetered scope: skip.
    if let Some(budget) = scope_budget(&ctx.client, &elig, &ns).await? {
        let siblings =
            active_sibling_claims(&snm_api, Some((&name, &demand))).await?;
        match partition_budget(&budget, &siblings) {
            Partition::Shortage {
                deficit,
                eviction_candidate,
            } => {
                // The newest claim that already reached a state yields
                // first; the claimant itself qualifies once it has
                // progressed, in which case it removes itself.
                if let Some(victim) = eviction_candidate {
                    match snm_api.delete(&victim, &DeleteParams::default()).await
                    {
                        Ok(_) => {
                            emit_warning(
                                &ctx.recorder,
                                &ns,
                                &victim,
                                None,
                                REASON_EVICTED,
                                "Delete",
                                Some(
                                    "evicted to relieve budget pressure"
                                        .to_string(),
                                ),
                            )
                            .await;
                        }
                        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                        Err(e) => return Err(e.into()),
                    }
                    if victim == name {
                        return Ok(Action::await_change());
                    }
                }
                let msg = format!(
                    "insufficient budget at parent: short by {:?}",
                    millis_to_quantities(&deficit)
                );
                emit_warning(
                    &ctx.recorder,
                    &ns,
                    &name,
                    uid.as_deref(),
                    REASON_SHORTAGE,
                    "Reconcile",
                    Some(msg.clone()),
                )
                .await;
                let failed = current.failed_count() + 1;
                let child = current.status.as_ref().and_then(|s| s.child.clone());
                advance(
                    &snm_api,
                    &mut current,
                    STATE_FAILED,
                    Some(msg),
                    Some(failed),
                    child,
                )
                .await?;
                return Ok(if failed >= BACKOFF_LIMIT {
                    Action::await_change()
                } else {
                    Action::requeue(ctx.cfg.shortage_retry())
                });
            }
            Partition::Fits { remaining } => {
                let parent_kind = elig
                    .parent_labels
                    .get(labels::KIND)
                    .map(String::as_str)
                    .unwrap_or("core");
                write_quota(
                    &ctx.client,
                    &ns,
                    &format!("{parent_kind}-quota"),
                    &remaining,
                )
                .await?;
            }
        }
    }
    advance(
        &snm_api,
        &mut current,
        STATE_PARTITIONED,
        Some("budget partitioned at parent".to_string()),
        None,
        Some(child_name.clone()),
    )
    .await?;

    match mode {
        SnmMode::Workspace => {
            ensure_child_namespace(&ctx.client, &obj, &elig, &ns, &child_name)
                .await?
        }
        SnmMode::Subtenant => {
            ensure_child_tenant(&ctx.client, &obj, &elig, &ns, &child_name)
                .await?
        }
    }
    advance(
        &snm_api,
        &mut current,
        STATE_CREATED,
        Some("child created".to_string()),
        None,
        Some(child_name.clone()),
    )
    .await?;

    // Second partition of the pass: the claim's own budget against its
    // descendants, with the same shortage semantics as the parent side.
    match mode {
        SnmMode::Workspace => {
            if let Partition::Shortage {
                deficit,
                eviction_candidate,
            } = apply_child_quota(&ctx.client, &child_name, &demand).await?
            {
                if let Some(victim) = eviction_candidate {
                    let child_snm: Api<SubNamespace> =
                        Api::namespaced(ctx.client.clone(), &child_name);
                    match child_snm
                        .delete(&victim, &DeleteParams::default())
                        .await
                    {
                        Ok(_) => {
                            emit_warning(
                                &ctx.recorder,
                                &child_name,
                                &victim,
                                None,
                                REASON_EVICTED,
                                "Delete",
                                Some(
                                    "evicted to relieve budget pressure"
                                        .to_string(),
                                ),
                            )
                            .await;
                        }
                        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                let msg = format!(
                    "descendants exceed this claim's own budget: short by {:?}",
                    millis_to_quantities(&deficit)
                );
                emit_warning(
                    &ctx.recorder,
                    &ns,
                    &name,
                    uid.as_deref(),
                    REASON_SHORTAGE,
                    "Reconcile",
                    Some(msg.clone()),
                )
                .await;
                let failed = current.failed_count() + 1;
                advance(
                    &snm_api,
                    &mut current,
                    STATE_FAILED,
                    Some(msg),
                    Some(failed),
                    Some(child_name.clone()),
                )
                .await?;
                return Ok(if failed >= BACKOFF_LIMIT {
                    Action::await_change()
                } else {
                    Action::requeue(ctx.cfg.shortage_retry())
                });
            }
        }
        SnmMode::Subtenant => {
            apply_subtenant_quota(&ctx.client, &obj, &child_name, &demand)
                .await?
        }
    }
    advance(
        &snm_api,
        &mut current,
        STATE_QUOTA_SET,
        Some("child quota set".to_string()),
        None,
        Some(child_name.clone()),
    )
    .await?;

    if mode == SnmMode::Workspace {
        match obj.owner_contact() {
            Some(contact) => {
                ensure_workspace_owner_binding(
                    &ctx.client,
                    &child_name,
                    &contact.email,
                )
                .await?
            }
            None => {
                remove_workspace_owner_binding(&ctx.client, &child_name)
                    .await?
            }
        }

        let done =
            reconcile_inheritance(&ctx.client, &obj, &ns, &child_name).await?;
        if !done {
            let failed = current.status.as_ref().and_then(|s| s.failed);
            advance(
                &snm_api,
                &mut current,
                STATE_RECONCILIATION,
                Some("inheritance partially applied; retrying".to_string()),
                failed,
                Some(child_name.clone()),
            )
            .await?;
            return Ok(Action::requeue(ctx.cfg.reconciliation_retry()));
        }
    }

    if obj.state() != Some(STATE_ESTABLISHED) {
        emit_event(
            &ctx.recorder,
            &ns,
            &name,
            uid.as_deref(),
            REASON_FORMED,
            "Reconcile",
            Some(format!("subsidiary namespace {child_name} established")),
        )
        .await;
    }
    advance(
        &snm_api,
        &mut current,
        STATE_ESTABLISHED,
        Some("subsidiary namespace established".to_string()),
        None,
        Some(child_name),
    )
    .await?;

    Ok(next_wakeup(&obj, &ctx.cfg))
}

/// Pick the next wakeup: the sync cadence for continuously mirrored
/// workspaces, a slower revalidation cadence otherwise, capped by the
/// time left to expiry. All land on the controller's single queue.
fn next_wakeup(obj: &SubNamespace, cfg: &SnmConfig) -> Action {
    let mut delay = if obj.sync_enabled() {
        cfg.sync_interval()
    } else {
        cfg.revalidate_interval()
    };
    if let Some(expiry) = obj.expiry() {
        let left = (expiry - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(0));
        delay = delay.min(left);
    }
    Action::requeue(delay)
}

/// Write the status through a full replace carrying the last observed
/// resourceVersion; a concurrent writer makes this 409 and the pass
/// retries with fresh state.
async fn advance(
    api: &Api<SubNamespace>,
    current: &mut SubNamespace,
    state: &str,
    message: Option<String>,
    failed: Option<u32>,
    child: Option<String>,
) -> Result<(), ReconcileErr> {
    let next = SubNamespaceStatus {
        state: Some(state.to_string()),
        message,
        failed,
        child,
    };
    if current.status.as_ref() == Some(&next) {
        return Ok(());
    }
    current.status = Some(next);
    let name = current.name_any();
    let data = serde_json::to_vec(&current)?;
    *current = api
        .replace_status(&name, &PostParams::default(), data)
        .await?;
    Ok(())
}

/// Count a failed pass and schedule the retry, or go quiet once the
/// limit is reached.
async fn fail_pass(
    api: &Api<SubNamespace>,
    current: &mut SubNamespace,
    ctx: &ControllerContext,
    message: String,
) -> Result<Action, ReconcileErr> {
    let failed = current.failed_count() + 1;
    let child = current.status.as_ref().and_then(|s| s.child.clone());
    advance(api, current, STATE_FAILED, Some(message), Some(failed), child)
        .await?;
    Ok(if failed >= BACKOFF_LIMIT {
        Action::await_change()
    } else {
        Action::requeue(ctx.cfg.error_retry())
    })
}

async fn ensure_finalizer(
    api: &Api<SubNamespace>,
    obj: &SubNamespace,
) -> Result<(), ReconcileErr> {
    let present = obj
        .meta()
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|x| x == FINALIZER))
        .unwrap_or(false);
    if present {
        return Ok(());
    }
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Teardown: drop the owned child, hand the claimed budget back to the
/// parent, then release the finalizer. Restitution is best-effort; a
/// sibling's next pass recomputes the same quota from scratch.
async fn finalize(
    obj: &SubNamespace,
    ctx: &ControllerContext,
    ns: &str,
    name: &str,
) -> Result<Action, ReconcileErr> {
    if let Some(mode) = obj.mode() {
        if let Err(e) = release_child(obj, ctx, ns, mode).await {
            warn!(ns = %ns, name = %name, error = %e, "child cleanup during teardown failed");
        }
    }

    if let Err(e) = restitute_parent_quota(obj, ctx, ns).await {
        warn!(ns = %ns, name = %name, error = %e, "budget restitution failed; a sibling pass will recompute");
    }

    // The grant pair is cluster-scoped; the garbage collector ignores
    // its namespaced owner reference, so it is dropped here.
    if let Err(e) =
        revoke_object_ownership(&ctx.client, "subnamespaces", name).await
    {
        warn!(ns = %ns, name = %name, error = %e, "owner grant revocation during teardown failed");
    }

    let snm_api: Api<SubNamespace> = Api::namespaced(ctx.client.clone(), ns);
    let finalizers: Vec<String> = obj
        .meta()
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != FINALIZER)
        .collect();
    let patch = json!({"metadata": {"finalizers": finalizers}});
    match snm_api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }
    Ok(Action::await_change())
}

/// Delete the child object if the claim owns one.
async fn release_child(
    obj: &SubNamespace,
    ctx: &ControllerContext,
    _ns: &str,
    mode: SnmMode,
) -> Result<(), kube::Error> {
    let Some(child) = obj.status.as_ref().and_then(|s| s.child.clone()) else {
        return Ok(());
    };
    let meta = child_meta(&ctx.client, mode, &child).await?;
    if check_child_ownership(meta.as_ref(), obj) != Ownership::Owned {
        return Ok(());
    }
    let res = match mode {
        SnmMode::Workspace => {
            let api: Api<Namespace> = Api::all(ctx.client.clone());
            api.delete(&child, &DeleteParams::default()).await.map(|_| ())
        }
        SnmMode::Subtenant => {
            // The assigned budget lives in a cluster-scoped
            // TenantResourceQuota that the garbage collector will not
            // chase through a namespaced owner; drop it alongside.
            let trq_api: Api<TenantResourceQuota> =
                Api::all(ctx.client.clone());
            match trq_api.delete(&child, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e),
            }
            let api: Api<Tenant> = Api::all(ctx.client.clone());
            api.delete(&child, &DeleteParams::default()).await.map(|_| ())
        }
    };
    match res {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e),
    }
}

/// Recompute the parent-side quota without this claim, so the budget
/// it held becomes available again.
async fn restitute_parent_quota(
    obj: &SubNamespace,
    ctx: &ControllerContext,
    ns: &str,
) -> Result<(), ReconcileErr> {
    let elig = match eligibility_check(&ctx.client, ns).await {
        Ok(e) => e,
        Err(AccessErr::Ineligible(_)) => return Ok(()),
        Err(AccessErr::Api(e)) => return Err(e.into()),
    };
    let Some(budget) = scope_budget(&ctx.client, &elig, ns).await? else {
        return Ok(());
    };
    let snm_api: Api<SubNamespace> = Api::namespaced(ctx.client.clone(), ns);
    let mut siblings = active_sibling_claims(&snm_api, None).await?;
    siblings.retain(|s| Some(s.name.as_str()) != obj.metadata.name.as_deref());
    if let Partition::Fits { remaining } = partition_budget(&budget, &siblings)
    {
        let parent_kind = elig
            .parent_labels
            .get(labels::KIND)
            .map(String::as_str)
            .unwrap_or("core");
        write_quota(&ctx.client, ns, &format!("{parent_kind}-quota"), &remaining)
            .await?;
    }
    Ok(())
}

async fn child_meta(
    client: &Client,
    mode: SnmMode,
    child_name: &str,
) -> Result<Option<ObjectMeta>, kube::Error> {
    Ok(match mode {
        SnmMode::Workspace => {
            let api: Api<Namespace> = Api::all(client.clone());
            api.get_opt(child_name).await?.map(|n| n.metadata)
        }
        SnmMode::Subtenant => {
            let api: Api<Tenant> = Api::all(client.clone());
            api.get_opt(child_name).await?.map(|t| t.metadata)
        }
    })
}

fn owner_reference(obj: &SubNamespace) -> OwnerReference {
    OwnerReference {
        api_version: "core.edge-net.io/v1alpha1".to_string(),
        kind: "SubNamespace".to_string(),
        name: obj.name_any(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: None,
    }
}

enum ResolvedDemand {
    Demand(BTreeMap<String, i128>),
    /// Slice-driven claim whose slice is unusable and which declares
    /// no allocation to fall back on; the pass fails.
    Unresolvable(String),
}

/// A claim with a declared allocation may fall back on it while its
/// slice is missing or unbound; one without cannot proceed.
fn slice_fallback(
    obj: &SubNamespace,
    claim_name: &str,
    claim_exists: bool,
) -> Result<(), String> {
    if !obj.resource_allocation().is_empty() {
        return Ok(());
    }
    Err(if claim_exists {
        format!("slice claim {claim_name} is not bound")
    } else {
        format!("slice claim {claim_name} does not exist")
    })
}

/// Resource demand for this claim: either the bound slice's node
/// capacity, or the declared allocation.
async fn resolve_allocation(
    client: &Client,
    obj: &SubNamespace,
    ns: &str,
) -> Result<ResolvedDemand, ReconcileErr> {
    if let Some(claim_name) = obj.slice_claim() {
        let claims: Api<SliceClaim> = Api::namespaced(client.clone(), ns);
        let claim = claims.get_opt(claim_name).await?;
        match &claim {
            Some(c) if c.is_bound() => {
                return Ok(ResolvedDemand::Demand(
                    slice_capacity(client, claim_name).await?,
                ));
            }
            _ => {
                if let Err(msg) =
                    slice_fallback(obj, claim_name, claim.is_some())
                {
                    return Ok(ResolvedDemand::Unresolvable(msg));
                }
            }
        }
    }
    Ok(ResolvedDemand::Demand(demand_millis(
        obj.resource_allocation(),
    )?))
}

/// Sum the capacity of the nodes pre-reserved for a slice.
async fn slice_capacity(
    client: &Client,
    claim_name: &str,
) -> Result<BTreeMap<String, i128>, ReconcileErr> {
    let nodes: Api<Node> = Api::all(client.clone());
    let selector = format!(
        "{}=public,{}={}",
        labels::ACCESS,
        labels::PRE_RESERVATION,
        claim_name
    );
    let list = nodes
        .list(&ListParams::default().labels(&selector))
        .await?;
    let mut total: BTreeMap<String, i128> = BTreeMap::new();
    for node in list.items {
        let Some(capacity) = node.status.and_then(|s| s.capacity) else {
            continue;
        };
        for (resource, quantity) in &capacity {
            match crate::quota::quantity_millis(quantity) {
                Ok(v) => *total.entry(resource.clone()).or_insert(0) += v,
                Err(e) => {
                    warn!(node = %node.metadata.name.as_deref().unwrap_or(""), resource = %resource, error = %e, "skipping unparsable node capacity");
                }
            }
        }
    }
    Ok(total)
}

/// The budget this namespace partitions: the tenant's net quota when
/// the parent is a core namespace, the owning claim's allocation when
/// it is itself a subsidiary namespace. `None` means the scope is
/// unmetered.
async fn scope_budget(
    client: &Client,
    elig: &Eligibility,
    ns: &str,
) -> Result<Option<BTreeMap<String, i128>>, ReconcileErr> {
    match elig.parent_labels.get(labels::KIND).map(String::as_str) {
        Some("core") => {
            let trq_api: Api<TenantResourceQuota> = Api::all(client.clone());
            let tenant_name = elig.tenant.name_any();
            match trq_api.get_opt(&tenant_name).await? {
                Some(trq) => Ok(Some(trq.net_budget(Utc::now())?)),
                None => Ok(None),
            }
        }
        Some("sub") => {
            let owner = elig.parent_labels.get(labels::OWNER);
            let parent_ns = elig.parent_labels.get(labels::PARENT_NAMESPACE);
            let (Some(owner), Some(parent_ns)) = (owner, parent_ns) else {
                return Ok(None);
            };
            let api: Api<SubNamespace> =
                Api::namespaced(client.clone(), parent_ns);
            match api.get_opt(owner).await? {
                Some(owning) => {
                    Ok(Some(demand_millis(owning.resource_allocation())?))
                }
                None => Ok(None),
            }
        }
        _ => {
            warn!(ns = %ns, "parent namespace has no kind label; treating scope as unmetered");
            Ok(None)
        }
    }
}

/// Claims of every active SubNamespace in the namespace, with this
/// pass's own resolved demand substituted for the claimant. Malformed
/// sibling allocations are skipped rather than poisoning the pass.
async fn active_sibling_claims(
    api: &Api<SubNamespace>,
    claimant: Option<(&str, &BTreeMap<String, i128>)>,
) -> Result<Vec<SiblingClaim>, ReconcileErr> {
    let list = api.list(&ListParams::default()).await?;
    let mut claims = Vec::new();
    for item in list.items {
        if !item.is_active() || item.meta().deletion_timestamp.is_some() {
            continue;
        }
        let item_name = item.name_any();
        let demand = match claimant {
            Some((name, demand)) if *name == item_name => demand.clone(),
            _ => match demand_millis(item.resource_allocation()) {
                Ok(d) => d,
                Err(e) => {
                    warn!(name = %item_name, error = %e, "skipping sibling with malformed allocation");
                    continue;
                }
            },
        };
        let created = item
            .meta()
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(|| chrono::DateTime::<Utc>::MIN_UTC);
        claims.push(SiblingClaim {
            name: item_name,
            demand,
            created,
            evictable: item.has_progressed(),
        });
    }
    Ok(claims)
}

async fn write_quota(
    client: &Client,
    ns: &str,
    quota_name: &str,
    remaining: &BTreeMap<String, i128>,
) -> Result<(), kube::Error> {
    let quota = ResourceQuota {
        metadata: ObjectMeta {
            name: Some(quota_name.to_string()),
            namespace: Some(ns.to_string()),
            labels: Some(BTreeMap::from([(
                labels::GENERATED.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(millis_to_quantities(remaining)),
            ..Default::default()
        }),
        status: None,
    };
    let api: Api<ResourceQuota> = Api::namespaced(client.clone(), ns);
    create_or_update(&api, quota_name, quota).await
}

fn child_labels(
    obj: &SubNamespace,
    elig: &Eligibility,
    parent_ns: &str,
    kind: &str,
) -> BTreeMap<String, String> {
    let mut lbl = BTreeMap::new();
    lbl.insert(labels::GENERATED.to_string(), "true".to_string());
    lbl.insert(labels::KIND.to_string(), kind.to_string());
    lbl.insert(labels::TENANT.to_string(), elig.tenant.name_any());
    lbl.insert(labels::OWNER.to_string(), obj.name_any());
    lbl.insert(
        labels::PARENT_NAMESPACE.to_string(),
        parent_ns.to_string(),
    );
    lbl.insert(labels::CLUSTER_UID.to_string(), elig.cluster_uid.clone());
    if let Some(tenant_uid) = &elig.tenant.metadata.uid {
        lbl.insert(labels::TENANT_UID.to_string(), tenant_uid.clone());
    }
    if let Some(uid) = &obj.metadata.uid {
        lbl.insert(labels::REQUEST_UID.to_string(), uid.clone());
    }
    lbl
}

async fn ensure_child_namespace(
    client: &Client,
    obj: &SubNamespace,
    elig: &Eligibility,
    parent_ns: &str,
    child_name: &str,
) -> Result<(), ReconcileErr> {
    let mut annotations = BTreeMap::new();
    if let Some(claim) = obj.slice_claim() {
        // Pins every pod in the child onto the slice's nodes.
        annotations.insert(
            NODE_SELECTOR_ANNOTATION.to_string(),
            format!(
                "{}=private,{}={}",
                labels::ACCESS,
                labels::SLICE,
                claim
            ),
        );
    }
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(child_name.to_string()),
            labels: Some(child_labels(obj, elig, parent_ns, "sub")),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: Some(vec![owner_reference(obj)]),
            ..Default::default()
        },
        ..Default::default()
    };
    let api: Api<Namespace> = Api::all(client.clone());
    create_or_update(&api, child_name, namespace).await?;
    Ok(())
}

async fn ensure_child_tenant(
    client: &Client,
    obj: &SubNamespace,
    elig: &Eligibility,
    parent_ns: &str,
    child_name: &str,
) -> Result<(), ReconcileErr> {
    let contact = obj.owner_contact().ok_or_else(|| {
        ReconcileErr::Internal("subtenant without an owner contact".to_string())
    })?;
    let tenant = Tenant {
        metadata: ObjectMeta {
            name: Some(child_name.to_string()),
            labels: Some(child_labels(obj, elig, parent_ns, "core")),
            owner_references: Some(vec![owner_reference(obj)]),
            ..Default::default()
        },
        spec: TenantSpec {
            full_name: format!("{} {}", contact.firstname, contact.lastname),
            url: elig.tenant.spec.url.clone(),
            contact: contact.clone(),
            enabled: true,
        },
        status: None,
    };
    let api: Api<Tenant> = Api::all(client.clone());
    create_or_update(&api, child_name, tenant).await?;
    Ok(())
}

/// Size the child's own quota: partition the claim's allocation among
/// its active descendants. A fit writes the remainder as `sub-quota`;
/// a shortage is handed back to the caller for eviction and retry.
async fn apply_child_quota(
    client: &Client,
    child_ns: &str,
    demand: &BTreeMap<String, i128>,
) -> Result<Partition, ReconcileErr> {
    let child_api: Api<SubNamespace> = Api::namespaced(client.clone(), child_ns);
    let descendants = active_sibling_claims(&child_api, None).await?;
    let partition = partition_budget(demand, &descendants);
    if let Partition::Fits { remaining } = &partition {
        write_quota(client, child_ns, "sub-quota", remaining).await?;
    }
    Ok(partition)
}

/// A subtenant gets its budget as a TenantResourceQuota claim instead
/// of a namespace quota; its own core namespace is metered from there.
async fn apply_subtenant_quota(
    client: &Client,
    obj: &SubNamespace,
    child_name: &str,
    demand: &BTreeMap<String, i128>,
) -> Result<(), ReconcileErr> {
    let trq = TenantResourceQuota {
        metadata: ObjectMeta {
            name: Some(child_name.to_string()),
            labels: Some(BTreeMap::from([(
                labels::GENERATED.to_string(),
                "true".to_string(),
            )])),
            owner_references: Some(vec![owner_reference(obj)]),
            ..Default::default()
        },
        spec: TenantResourceQuotaSpec {
            claim: BTreeMap::from([(
                "initial".to_string(),
                ResourceTuning {
                    resource_list: millis_to_quantities(demand),
                    expiry: obj.spec.expiry.clone(),
                },
            )]),
            drop: BTreeMap::new(),
        },
        status: None,
    };
    let api: Api<TenantResourceQuota> = Api::all(client.clone());
    create_or_update(&api, child_name, trq).await?;
    Ok(())
}

/// Apply or revoke each inheritable kind per the claim's flags.
/// Returns false when any enabled kind only partially applied.
async fn reconcile_inheritance(
    client: &Client,
    obj: &SubNamespace,
    parent_ns: &str,
    child_ns: &str,
) -> Result<bool, kube::Error> {
    let mut done = true;
    for kind in InheritedKind::ALL {
        if obj.inheritance_flag(kind.flag()) {
            done &= kind.mirror(client, parent_ns, child_ns).await?;
        } else {
            kind.revoke(client, child_ns).await?;
        }
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Contact;
    use crate::crd::subnamespace::{SubNamespaceSpec, Workspace};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn snm(name: &str, ns: &str, uid: &str) -> SubNamespace {
        SubNamespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
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

    fn eligibility() -> Eligibility {
        Eligibility {
            cluster_uid: "cluster-1".to_string(),
            tenant: Tenant {
                metadata: ObjectMeta {
                    name: Some("acme".to_string()),
                    uid: Some("tenant-uid-1".to_string()),
                    ..Default::default()
                },
                spec: TenantSpec {
                    full_name: "Acme Inc".to_string(),
                    url: "https://acme.example".to_string(),
                    contact: Contact {
                        firstname: "Ada".to_string(),
                        lastname: "Lovelace".to_string(),
                        email: "ada@acme.example".to_string(),
                        phone: "1".to_string(),
                    },
                    enabled: true,
                },
                status: None,
            },
            parent_labels: BTreeMap::new(),
        }
    }

    #[test]
    fn owner_reference_points_back_at_the_claim() {
        let obj = snm("team", "acme-core", "uid-42");
        let or = owner_reference(&obj);
        assert_eq!(or.kind, "SubNamespace");
        assert_eq!(or.api_version, "core.edge-net.io/v1alpha1");
        assert_eq!(or.name, "team");
        assert_eq!(or.uid, "uid-42");
        assert_eq!(or.controller, Some(true));
    }

    #[test]
    fn child_labels_carry_the_full_identity_contract() {
        let obj = snm("team", "acme-core", "uid-42");
        let lbl = child_labels(&obj, &eligibility(), "acme-core", "sub");
        assert_eq!(lbl[labels::GENERATED], "true");
        assert_eq!(lbl[labels::KIND], "sub");
        assert_eq!(lbl[labels::TENANT], "acme");
        assert_eq!(lbl[labels::OWNER], "team");
        assert_eq!(lbl[labels::PARENT_NAMESPACE], "acme-core");
        assert_eq!(lbl[labels::CLUSTER_UID], "cluster-1");
        assert_eq!(lbl[labels::TENANT_UID], "tenant-uid-1");
        assert_eq!(lbl[labels::REQUEST_UID], "uid-42");
    }

    fn slice_snm(claim: &str, allocation: BTreeMap<String, Quantity>) -> SubNamespace {
        let mut obj = snm("team", "acme-core", "uid-42");
        let ws = obj.spec.workspace.as_mut().unwrap();
        ws.slice_claim = Some(claim.to_string());
        ws.resource_allocation = allocation;
        obj
    }

    #[test]
    fn unusable_slice_without_declared_allocation_cannot_proceed() {
        let obj = slice_snm("edge-slice", BTreeMap::new());
        assert_eq!(
            slice_fallback(&obj, "edge-slice", false),
            Err("slice claim edge-slice does not exist".to_string())
        );
        assert_eq!(
            slice_fallback(&obj, "edge-slice", true),
            Err("slice claim edge-slice is not bound".to_string())
        );
    }

    #[test]
    fn unusable_slice_falls_back_on_declared_allocation() {
        let obj = slice_snm(
            "edge-slice",
            BTreeMap::from([("cpu".to_string(), Quantity("2".to_string()))]),
        );
        assert_eq!(slice_fallback(&obj, "edge-slice", true), Ok(()));
    }

    fn cfg() -> SnmConfig {
        SnmConfig {
            sync_interval_secs: 30,
            shortage_retry_secs: 60,
            error_retry_secs: 60,
            reconciliation_retry_secs: 15,
            revalidate_interval_secs: 300,
        }
    }

    #[test]
    fn wakeup_always_requeues() {
        let obj = snm("team", "acme-core", "uid-42");
        assert_eq!(
            format!("{:?}", next_wakeup(&obj, &cfg())),
            format!("{:?}", Action::requeue(Duration::from_secs(300)))
        );
    }

    #[test]
    fn wakeup_uses_sync_cadence_when_enabled() {
        let mut obj = snm("team", "acme-core", "uid-42");
        obj.spec.workspace.as_mut().unwrap().sync = true;
        assert_eq!(
            format!("{:?}", next_wakeup(&obj, &cfg())),
            format!("{:?}", Action::requeue(Duration::from_secs(30)))
        );
    }

    #[test]
    fn wakeup_is_capped_by_imminent_expiry() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

        let mut obj = snm("team", "acme-core", "uid-42");
        obj.spec.expiry = Some(Time(Utc::now() + chrono::Duration::seconds(10)));
        let rendered = format!("{:?}", next_wakeup(&obj, &cfg()));
        let slow = format!("{:?}", Action::requeue(Duration::from_secs(300)));
        assert_ne!(rendered, slow);
    }
}
