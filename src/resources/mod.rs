//! Resource Ensurer
//!
//! Create-or-patch primitive plus the ownership and labelling helpers every
//! object created for a RestoreSession goes through.

mod ensure;

pub use ensure::*;

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Api, Client};

use crate::error::Result;

/// Name prefix of standard restore jobs
pub const RESTORE_JOB_PREFIX: &str = "restore-job-";

/// Name prefix of volume snapshot restore jobs
pub const VOLUME_SNAPSHOT_RESTORE_JOB_PREFIX: &str = "restore-vs-";

/// Label telling the job purger whether a finished job may be removed
pub const DELETE_JOB_ON_COMPLETION_LABEL: &str = "backup.oso.sh/delete-job-on-completion";

/// Name of the standard restore job of a session
pub fn restore_job_name(session: &str) -> String {
    format!("{}{}", RESTORE_JOB_PREFIX, session)
}

/// Name of the volume snapshot restore job of a session
pub fn volume_snapshot_restore_job_name(session: &str) -> String {
    format!("{}{}", VOLUME_SNAPSHOT_RESTORE_JOB_PREFIX, session)
}

/// Add `owner` to the object's owner references, replacing any entry with the same uid
pub fn ensure_owner_reference(meta: &mut ObjectMeta, owner: &OwnerReference) {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    match refs.iter_mut().find(|r| r.uid == owner.uid) {
        Some(existing) => *existing = owner.clone(),
        None => refs.push(owner.clone()),
    }
}

/// Merge `labels` into the object's labels, keeping labels set by others
pub fn upsert_labels(meta: &mut ObjectMeta, labels: &BTreeMap<String, String>) {
    let current = meta.labels.get_or_insert_with(BTreeMap::new);
    for (k, v) in labels {
        current.insert(k.clone(), v.clone());
    }
}

/// Metadata for a namespaced object
pub fn namespaced_meta(
    name: impl Into<String>,
    namespace: impl Into<String>,
    labels: &BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

/// Ensure a service account owned by `owner` exists
pub async fn ensure_service_account(
    client: &Client,
    name: &str,
    namespace: &str,
    owner: &OwnerReference,
    labels: &BTreeMap<String, String>,
) -> Result<EnsureOutcome> {
    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let (_, outcome) = create_or_patch(&api, namespaced_meta(name, namespace, labels), |mut sa| {
        ensure_owner_reference(&mut sa.metadata, owner);
        upsert_labels(&mut sa.metadata, labels);
        sa
    })
    .await?;
    Ok(outcome)
}

/// Reconcile a job's ownership and labels, setting its template only on creation.
///
/// A job's pod template is immutable once created, so an existing job keeps
/// the template it was created with.
pub fn with_job_template(
    mut job: Job,
    owner: &OwnerReference,
    labels: &BTreeMap<String, String>,
    pod_spec: PodSpec,
) -> Job {
    ensure_owner_reference(&mut job.metadata, owner);
    upsert_labels(&mut job.metadata, labels);
    if job.spec.is_none() {
        job.spec = Some(JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        });
    }
    job
}

/// Ensure a job owned by `owner` running `pod_spec` exists
pub async fn ensure_job(
    client: &Client,
    name: &str,
    namespace: &str,
    owner: &OwnerReference,
    labels: &BTreeMap<String, String>,
    pod_spec: PodSpec,
) -> Result<EnsureOutcome> {
    let api: Api<Job> = Api::namespaced(client.clone(), namespace);
    let (_, outcome) = create_or_patch(&api, namespaced_meta(name, namespace, labels), |job| {
        with_job_template(job, owner, labels, pod_spec.clone())
    })
    .await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(uid: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "backup.oso.sh/v1alpha1".to_string(),
            kind: "RestoreSession".to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn owner_reference_is_upserted_by_uid() {
        let mut meta = ObjectMeta::default();
        ensure_owner_reference(&mut meta, &owner("uid-1", "old"));
        ensure_owner_reference(&mut meta, &owner("uid-1", "new"));
        ensure_owner_reference(&mut meta, &owner("uid-2", "other"));

        let refs = meta.owner_references.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "new");
    }

    fn pod(image: &str) -> PodSpec {
        PodSpec {
            containers: vec![k8s_openapi::api::core::v1::Container {
                name: "restore".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn existing_job_template_is_never_rewritten() {
        let owner = owner("uid-1", "pg-restore");
        let labels = BTreeMap::from([("app".to_string(), "restore".to_string())]);
        let meta = namespaced_meta("restore-job-pg-restore", "demo", &labels);

        let created = match plan_write::<Job, _>(None, &meta, |j| {
            with_job_template(j, &owner, &labels, pod("restic:0.9"))
        })
        .unwrap()
        {
            WriteOp::Create(job) => job,
            other => panic!("expected create, got {:?}", other),
        };
        let template = created.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(template.containers[0].image.as_deref(), Some("restic:0.9"));

        let again = plan_write(Some(&created), &meta, |j| {
            with_job_template(j, &owner, &labels, pod("restic:0.10"))
        })
        .unwrap();
        assert!(matches!(again, WriteOp::Unchanged));
    }

    #[test]
    fn job_names_carry_variant_prefix() {
        assert_eq!(restore_job_name("pg"), "restore-job-pg");
        assert_eq!(volume_snapshot_restore_job_name("pg"), "restore-vs-pg");
    }

    #[test]
    fn upsert_labels_keeps_foreign_labels() {
        let mut meta = ObjectMeta {
            labels: Some(BTreeMap::from([("team".to_string(), "db".to_string())])),
            ..Default::default()
        };
        upsert_labels(
            &mut meta,
            &BTreeMap::from([("app".to_string(), "restore".to_string())]),
        );
        let labels = meta.labels.unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["team"], "db");
    }
}
