//! Restore targets
//!
//! Classifies target kinds, counts the hosts a session waits for, and signals
//! workload controllers to add or remove the restore init-container.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use kube::{
    api::{ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams},
    Api, Client,
};
use serde_json::json;
use tracing::{debug, info};

use crate::crd::{RestoreDriver, RestoreTarget};
use crate::error::{not_found_as, Error, Result};

/// Annotation bumped on a workload to make its controller re-evaluate the restore init-container
pub const RESTORE_TRIGGER_ANNOTATION: &str = "backup.oso.sh/restore-trigger";

/// How a target kind is restored
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupModel {
    /// An init-container injected into the workload's own pods
    Sidecar,
    /// A standalone job
    Job,
}

/// Restore model of a target kind
pub fn backup_model(kind: &str) -> BackupModel {
    match kind {
        "Deployment" | "DaemonSet" | "StatefulSet" | "ReplicaSet" | "ReplicationController"
        | "DeploymentConfig" => BackupModel::Sidecar,
        _ => BackupModel::Job,
    }
}

/// Whether the target is restored through an injected init-container
pub fn uses_sidecar_model(target: Option<&RestoreTarget>) -> bool {
    target.is_some_and(|t| backup_model(&t.target_ref.kind) == BackupModel::Sidecar)
}

/// API group/version/kind of a sidecar model workload
pub fn workload_gvk(kind: &str) -> Option<GroupVersionKind> {
    match kind {
        "Deployment" | "DaemonSet" | "StatefulSet" | "ReplicaSet" => {
            Some(GroupVersionKind::gvk("apps", "v1", kind))
        }
        "ReplicationController" => Some(GroupVersionKind::gvk("", "v1", kind)),
        "DeploymentConfig" => Some(GroupVersionKind::gvk("apps.openshift.io", "v1", kind)),
        _ => None,
    }
}

/// Host count known without reading the target workload
pub fn static_total_hosts(target: Option<&RestoreTarget>, driver: RestoreDriver) -> Option<i32> {
    match (target, driver) {
        (None, _) => Some(1),
        (Some(t), RestoreDriver::VolumeSnapshotter) => Some(t.replicas.unwrap_or(1)),
        (Some(t), RestoreDriver::StandardJob) => match t.target_ref.kind.as_str() {
            "StatefulSet" | "DaemonSet" => None,
            _ => Some(1),
        },
    }
}

/// Number of hosts expected to report an outcome
pub async fn total_hosts(
    client: &Client,
    target: Option<&RestoreTarget>,
    namespace: &str,
    driver: RestoreDriver,
) -> Result<i32> {
    if let Some(hosts) = static_total_hosts(target, driver) {
        return Ok(hosts);
    }
    let Some(target) = target else {
        return Ok(1);
    };
    let name = &target.target_ref.name;

    match target.target_ref.kind.as_str() {
        "StatefulSet" => {
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
            let sts = api
                .get(name)
                .await
                .map_err(|e| not_found_as(e, format!("statefulset {}/{}", namespace, name)))?;
            Ok(sts.spec.and_then(|s| s.replicas).unwrap_or(1))
        }
        "DaemonSet" => {
            let api: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
            let ds = api
                .get(name)
                .await
                .map_err(|e| not_found_as(e, format!("daemonset {}/{}", namespace, name)))?;
            Ok(ds.status.map(|s| s.desired_number_scheduled).unwrap_or(0))
        }
        _ => Ok(1),
    }
}

/// Channel to the controller that injects restore init-containers
#[async_trait]
pub trait WorkloadNotifier: Send + Sync {
    /// Ask the workload's controller to re-evaluate its restore init-container
    async fn notify(&self, kind: &str, namespace: &str, name: &str) -> Result<()>;
}

/// Notifies by stamping [`RESTORE_TRIGGER_ANNOTATION`] on the workload
pub struct AnnotationNotifier {
    client: Client,
}

impl AnnotationNotifier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadNotifier for AnnotationNotifier {
    async fn notify(&self, kind: &str, namespace: &str, name: &str) -> Result<()> {
        let gvk = workload_gvk(kind)
            .ok_or_else(|| Error::validation(format!("kind {} does not use the sidecar model", kind)))?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &ApiResource::from_gvk(&gvk));

        let mut annotations = serde_json::Map::new();
        annotations.insert(
            RESTORE_TRIGGER_ANNOTATION.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true).into(),
        );
        let patch = json!({ "metadata": { "annotations": annotations } });
        debug!(kind, namespace, name, "Notifying workload controller");
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| match not_found_as(e, format!("{} {}/{}", kind, namespace, name)) {
                Error::Kube(e) => Error::Notify(e.to_string()),
                other => other,
            })?;
        info!(kind, namespace, name, "Workload controller notified");
        Ok(())
    }
}
