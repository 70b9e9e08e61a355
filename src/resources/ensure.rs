//! Idempotent create-or-patch for Kubernetes objects
//!
//! The current object (or a default carrying the desired metadata) is passed
//! through a mutation function. A write is issued only when the mutation
//! changed something, and then only as a JSON patch of the changed fields, so
//! fields owned by other writers are left alone.

use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// What [`create_or_patch`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Object did not exist and was created
    Created,
    /// Object existed and drifted from the desired state
    Patched,
    /// Object already matched the desired state
    Unchanged,
}

/// Write required to converge an object
#[derive(Debug)]
pub enum WriteOp<K> {
    /// Create the object
    Create(K),
    /// Patch the existing object
    Patch(json_patch::Patch),
    /// Nothing to do
    Unchanged,
}

/// Decide which write converges `current` toward `mutate(current)`.
///
/// When the object is absent the mutation runs over a default object whose
/// metadata is `meta`.
pub fn plan_write<K, F>(current: Option<&K>, meta: &ObjectMeta, mutate: F) -> Result<WriteOp<K>>
where
    K: Resource + Default + Clone + Serialize,
    F: FnOnce(K) -> K,
{
    match current {
        None => {
            let mut fresh = K::default();
            *fresh.meta_mut() = meta.clone();
            Ok(WriteOp::Create(mutate(fresh)))
        }
        Some(existing) => {
            let desired = mutate(existing.clone());
            let before = serde_json::to_value(existing)?;
            let after = serde_json::to_value(&desired)?;
            let patch = json_patch::diff(&before, &after);
            if patch.0.is_empty() {
                Ok(WriteOp::Unchanged)
            } else {
                Ok(WriteOp::Patch(patch))
            }
        }
    }
}

/// Create the object named by `meta`, or patch it if it drifted.
///
/// When another writer creates the object between the read and the create,
/// the object is read again and patched toward `mutate` instead.
pub async fn create_or_patch<K, F>(
    api: &Api<K>,
    meta: ObjectMeta,
    mutate: F,
) -> Result<(K, EnsureOutcome)>
where
    K: Resource + Default + Clone + Serialize + DeserializeOwned + Debug,
    F: Fn(K) -> K,
{
    let name = meta
        .name
        .clone()
        .ok_or_else(|| Error::validation("object name is required for create-or-patch"))?;

    let current = api.get_opt(&name).await?;
    match converge(api, &name, current, &meta, &mutate).await {
        Err(Error::Kube(e)) if is_already_exists(&e) => {
            debug!(name = %name, "Object created concurrently, patching it instead");
            let current = api.get_opt(&name).await?;
            converge(api, &name, current, &meta, &mutate).await
        }
        other => other,
    }
}

/// Whether a create failed because the object already exists
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists")
}

async fn converge<K, F>(
    api: &Api<K>,
    name: &str,
    current: Option<K>,
    meta: &ObjectMeta,
    mutate: &F,
) -> Result<(K, EnsureOutcome)>
where
    K: Resource + Default + Clone + Serialize + DeserializeOwned + Debug,
    F: Fn(K) -> K,
{
    let plan = plan_write(current.as_ref(), meta, mutate)?;

    match (plan, current) {
        (WriteOp::Create(obj), _) => {
            let created = api.create(&PostParams::default(), &obj).await?;
            debug!(name = %created.name_any(), "Created object");
            Ok((created, EnsureOutcome::Created))
        }
        (WriteOp::Patch(patch), _) => {
            let patched = api
                .patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
                .await?;
            debug!(name = %patched.name_any(), "Patched object");
            Ok((patched, EnsureOutcome::Patched))
        }
        (WriteOp::Unchanged, Some(existing)) => Ok((existing, EnsureOutcome::Unchanged)),
        (WriteOp::Unchanged, None) => Err(Error::not_found(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceAccount;
    use std::collections::BTreeMap;

    fn meta() -> ObjectMeta {
        ObjectMeta {
            name: Some("restore-job-pg".to_string()),
            namespace: Some("demo".to_string()),
            ..Default::default()
        }
    }

    fn label(mut sa: ServiceAccount) -> ServiceAccount {
        sa.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("app".to_string(), "restore".to_string());
        sa
    }

    #[test]
    fn absent_object_is_created_with_meta() {
        let plan = plan_write::<ServiceAccount, _>(None, &meta(), label).unwrap();
        match plan {
            WriteOp::Create(sa) => {
                assert_eq!(sa.metadata.name.as_deref(), Some("restore-job-pg"));
                assert_eq!(sa.metadata.namespace.as_deref(), Some("demo"));
                assert_eq!(sa.metadata.labels.unwrap()["app"], "restore");
            }
            other => panic!("expected create, got {:?}", other),
        }
    }

    #[test]
    fn converged_object_is_left_alone() {
        let existing = label(ServiceAccount {
            metadata: meta(),
            ..Default::default()
        });
        let plan = plan_write(Some(&existing), &meta(), label).unwrap();
        assert!(matches!(plan, WriteOp::Unchanged));
    }

    #[test]
    fn drift_produces_minimal_patch() {
        let mut existing = ServiceAccount {
            metadata: meta(),
            ..Default::default()
        };
        existing.metadata.resource_version = Some("42".to_string());
        let plan = plan_write(Some(&existing), &meta(), label).unwrap();
        match plan {
            WriteOp::Patch(patch) => {
                let ops = serde_json::to_value(&patch).unwrap();
                let ops = ops.as_array().unwrap();
                assert_eq!(ops.len(), 1);
                assert_eq!(ops[0]["path"], "/metadata/labels");
            }
            other => panic!("expected patch, got {:?}", other),
        }
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn only_already_exists_triggers_replan() {
        assert!(is_already_exists(&api_error(409, "AlreadyExists")));
        assert!(!is_already_exists(&api_error(409, "Conflict")));
        assert!(!is_already_exists(&api_error(422, "Invalid")));
    }

    #[test]
    fn lost_create_race_replans_as_patch() {
        let plan = plan_write::<ServiceAccount, _>(None, &meta(), label).unwrap();
        assert!(matches!(plan, WriteOp::Create(_)));

        // the winner created the object without our label
        let winner = ServiceAccount {
            metadata: meta(),
            ..Default::default()
        };
        let replanned = plan_write(Some(&winner), &meta(), label).unwrap();
        assert!(matches!(replanned, WriteOp::Patch(_)));
    }
}
