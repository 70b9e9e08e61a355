//! Cross-namespace repository reader
//!
//! A job reading a Repository from another namespace gets a role in the
//! repository's namespace limited to that repository and its credential
//! secret, bound to the job's service account.

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{api::DeleteParams, Api, Client, Resource, ResourceExt};
use tracing::{debug, info};

use super::{bind, role_ref, service_account_subject};
use crate::crd::{Repository, RestoreSession, RESTORE_SESSION_LABEL};
use crate::error::{not_found_as, Error, Result};
use crate::resources::{create_or_patch, ensure_owner_reference, upsert_labels, RESTORE_JOB_PREFIX};

/// Name of the reader role for a repository
pub fn repo_reader_role_name(repository: &str) -> String {
    format!("backup-oso:repo-reader:{}", repository)
}

/// Name of the reader binding for a job
pub fn repo_reader_binding_name(job: &str, job_namespace: &str) -> String {
    format!("{}:{}:repo-reader", job, job_namespace)
}

/// Rules allowing reads of exactly one repository and its secret
pub fn repo_reader_rules(repository: &str, secret: &str) -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            api_groups: Some(vec!["backup.oso.sh".to_string()]),
            resources: Some(vec!["repositories".to_string()]),
            resource_names: Some(vec![repository.to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_string()]),
            resource_names: Some(vec![secret.to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        },
    ]
}

/// Job that reads the repository
#[derive(Clone, Debug)]
pub struct RepoReaderSubject<'a> {
    /// Job name
    pub job: &'a str,
    /// Job namespace
    pub namespace: &'a str,
    /// Service account the job runs as
    pub service_account: &'a str,
}

/// Ensure `subject` may read `repository` from the repository's namespace
pub async fn ensure_repo_reader_rbac(
    client: &Client,
    repository: &Repository,
    subject: &RepoReaderSubject<'_>,
    labels: &BTreeMap<String, String>,
) -> Result<()> {
    let repo_name = repository.name_any();
    let repo_ns = repository
        .namespace()
        .ok_or_else(|| Error::validation(format!("repository {} has no namespace", repo_name)))?;
    let owner: OwnerReference = repository
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation(format!("repository {} has no uid", repo_name)))?;
    let role_name = repo_reader_role_name(&repo_name);

    let roles: Api<Role> = Api::namespaced(client.clone(), &repo_ns);
    let meta = ObjectMeta {
        name: Some(role_name.clone()),
        namespace: Some(repo_ns.clone()),
        labels: Some(labels.clone()),
        ..Default::default()
    };
    let rules = repo_reader_rules(&repo_name, &repository.spec.backend.storage_secret_name);
    let (_, outcome) = create_or_patch(&roles, meta, |mut role| {
        ensure_owner_reference(&mut role.metadata, &owner);
        upsert_labels(&mut role.metadata, labels);
        role.rules = Some(rules.clone());
        role
    })
    .await?;
    debug!(role = %role_name, namespace = %repo_ns, ?outcome, "Ensured repo-reader role");

    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), &repo_ns);
    let binding_name = repo_reader_binding_name(subject.job, subject.namespace);
    let meta = ObjectMeta {
        name: Some(binding_name.clone()),
        namespace: Some(repo_ns.clone()),
        labels: Some(labels.clone()),
        ..Default::default()
    };
    let (_, outcome) = create_or_patch(&bindings, meta, |rb| {
        bind(
            rb,
            None,
            labels,
            role_ref(&role_name),
            service_account_subject(subject.service_account, subject.namespace),
        )
    })
    .await?;
    debug!(binding = %binding_name, namespace = %repo_ns, ?outcome, "Ensured repo-reader role binding");
    Ok(())
}

/// Delete the repo-reader binding created for a restore job.
///
/// Only jobs named with the restore job prefix are considered. Such a job
/// must carry the label naming its RestoreSession, and that session must
/// still exist since it tells where the repository lives.
pub async fn ensure_repo_reader_binding_deleted(client: &Client, job_meta: &ObjectMeta) -> Result<()> {
    let Some(job) = job_meta.name.as_deref() else {
        return Ok(());
    };
    if !job.starts_with(RESTORE_JOB_PREFIX) {
        return Ok(());
    }
    let job_ns = job_meta.namespace.clone().unwrap_or_default();

    let session_name = job_meta
        .labels
        .as_ref()
        .and_then(|l| l.get(RESTORE_SESSION_LABEL))
        .ok_or_else(|| {
            Error::dependency(format!(
                "job {}/{} is missing the {} label",
                job_ns, job, RESTORE_SESSION_LABEL
            ))
        })?;

    let sessions: Api<RestoreSession> = Api::namespaced(client.clone(), &job_ns);
    let session = sessions
        .get(session_name)
        .await
        .map_err(|e| not_found_as(e, format!("restoresession {}/{}", job_ns, session_name)))?;

    let repo_ns = session.repository_namespace();
    let binding_name = repo_reader_binding_name(job, &job_ns);
    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), &repo_ns);
    match bindings.delete(&binding_name, &DeleteParams::background()).await {
        Ok(_) => {
            info!(binding = %binding_name, namespace = %repo_ns, "Deleted repo-reader role binding");
            Ok(())
        }
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether a session reads its repository from another namespace
pub fn reads_foreign_repository(session: &RestoreSession) -> bool {
    session.repository_namespace() != session.meta().namespace.clone().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{RepositoryRef, RestoreSessionSpec};

    #[test]
    fn names_follow_convention() {
        assert_eq!(repo_reader_role_name("gcs-repo"), "backup-oso:repo-reader:gcs-repo");
        assert_eq!(
            repo_reader_binding_name("restore-job-pg", "demo"),
            "restore-job-pg:demo:repo-reader"
        );
    }

    #[test]
    fn reader_rules_are_scoped_to_named_objects() {
        let rules = repo_reader_rules("gcs-repo", "gcs-secret");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].resource_names.as_deref(), Some(&["gcs-repo".to_string()][..]));
        assert_eq!(rules[1].resource_names.as_deref(), Some(&["gcs-secret".to_string()][..]));
        assert!(rules.iter().all(|r| r.verbs == vec!["get".to_string()]));
    }

    #[test]
    fn foreign_repository_detection() {
        let mut rs = RestoreSession::new(
            "pg",
            RestoreSessionSpec {
                repository: RepositoryRef {
                    name: "gcs-repo".to_string(),
                    namespace: None,
                },
                ..Default::default()
            },
        );
        rs.metadata.namespace = Some("demo".to_string());
        assert!(!reads_foreign_repository(&rs));

        rs.spec.repository.namespace = Some("backups".to_string());
        assert!(reads_foreign_repository(&rs));
    }
}
