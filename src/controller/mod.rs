pub mod events;
pub mod inheritance;
pub mod ownership;
pub mod reconcile;

use std::sync::Arc;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    Client,
    api::Api,
    runtime::{
        Controller,
        controller::Action,
        events::{Recorder, Reporter},
        watcher::Config,
    },
};
use tracing::{error, info, warn};

use crate::config::SnmConfig;
use crate::crd::subnamespace::SubNamespace;

pub const FINALIZER: &str = "edge-net.io/subnamespace-finalizer";

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("kube api: {0}")]
    Api(#[from] kube::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("quantity: {0}")]
    Quantity(#[from] crate::quota::QuantityErr),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Clone)]
pub struct ControllerContext {
    pub client: Client,
    pub cfg: SnmConfig,
    pub recorder: Recorder,
}

pub async fn run_controller(client: Client, cfg: SnmConfig) -> anyhow::Result<()> {
    let api: Api<SubNamespace> = Api::all(client.clone());
    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: "edgenet-snm".into(),
            instance: None,
        },
    );
    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        cfg,
        recorder,
    });

    Controller::new(api, Config::default())
        .run(reconcile::reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => {
                    info!(object = %obj_ref.name, "reconciled: requeue={:?}", action)
                }
                Err(e) => error!(error = ?e, "reconcile error"),
            }
        })
        .await;

    Ok(())
}

fn error_policy(
    obj: Arc<SubNamespace>,
    error: &ReconcileErr,
    ctx: Arc<ControllerContext>,
) -> Action {
    warn!(
        ns = obj.metadata.namespace.as_deref().unwrap_or(""),
        name = obj.metadata.name.as_deref().unwrap_or(""),
        error = %error,
        "requeueing after error"
    );
    Action::requeue(ctx.cfg.error_retry())
}

pub(crate) fn build_obj_ref(
    ns: &str,
    name: &str,
    uid: Option<&str>,
) -> ObjectReference {
    ObjectReference {
        api_version: Some("core.edge-net.io/v1alpha1".to_string()),
        kind: Some("SubNamespace".to_string()),
        namespace: Some(ns.to_string()),
        name: Some(name.to_string()),
        uid: uid.map(|u| u.to_string()),
        ..Default::default()
    }
}
