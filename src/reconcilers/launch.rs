//! Launch strategies for a pending RestoreSession
//!
//! A session is restored by exactly one of three strategies, chosen from its
//! driver and target kind. Each one starts the restore and reports the phase
//! the session moves to.

use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Api, Resource, ResourceExt};
use tracing::{info, warn};

use crate::config::OperatorConfig;
use crate::controllers::Context;
use crate::crd::{Repository, RestoreDriver, RestoreSession, RestoreSessionPhase, RestoreSessionSpec};
use crate::error::{not_found_as, Error, Result};
use crate::metrics;
use crate::rbac::{
    ensure_repo_reader_rbac, ensure_restore_job_rbac, ensure_volume_snapshot_restore_job_rbac,
    reads_foreign_repository, JobIdentity, RepoReaderSubject,
};
use crate::resolve::{
    attach_local_backend, default_restore_security_context, implicit_inputs, merge_inputs,
    upsert_pod_security_context, ResolvedTask, TaskResolver,
};
use crate::resources::{
    ensure_job, ensure_service_account, restore_job_name, volume_snapshot_restore_job_name,
    EnsureOutcome, DELETE_JOB_ON_COMPLETION_LABEL,
};
use crate::workload::uses_sidecar_model;

/// How a session is restored
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// A job resolved from the session's Task
    StandardJob,
    /// An init-container injected into the target workload
    SidecarInjection,
    /// A job restoring volumes from snapshots
    VolumeSnapshot,
}

/// Phase a launch moves the session to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub phase: RestoreSessionPhase,
    /// What was launched, or why the launch failed
    pub message: String,
}

impl LaunchOutcome {
    fn running(message: impl Into<String>) -> Self {
        Self {
            phase: RestoreSessionPhase::Running,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            phase: RestoreSessionPhase::Failed,
            message: message.into(),
        }
    }
}

impl LaunchStrategy {
    /// Pick the strategy for a session
    pub fn select(spec: &RestoreSessionSpec) -> Self {
        match (&spec.target, spec.driver) {
            (Some(_), RestoreDriver::VolumeSnapshotter) => LaunchStrategy::VolumeSnapshot,
            (target, _) if uses_sidecar_model(target.as_ref()) => LaunchStrategy::SidecarInjection,
            _ => LaunchStrategy::StandardJob,
        }
    }

    /// Label value used in metrics and logs
    pub fn as_str(self) -> &'static str {
        match self {
            LaunchStrategy::StandardJob => "standard-job",
            LaunchStrategy::SidecarInjection => "sidecar-injection",
            LaunchStrategy::VolumeSnapshot => "volume-snapshot",
        }
    }

    /// Start the restore.
    ///
    /// Errors are returned for a retry. The standard job turns errors that a
    /// retry cannot fix into a Failed outcome instead.
    pub async fn launch(self, session: &RestoreSession, ctx: &Context) -> Result<LaunchOutcome> {
        match self {
            LaunchStrategy::StandardJob => match ensure_restore_job(session, ctx).await {
                Ok(job) => Ok(LaunchOutcome::running(format!("restore job {} created", job))),
                Err(e) if e.is_transient() => Err(e),
                Err(e) => {
                    warn!(name = %session.name_any(), error = %e, "Restore job could not be created");
                    Ok(LaunchOutcome::failed(e.to_string()))
                }
            },
            LaunchStrategy::SidecarInjection => {
                let target = session
                    .spec
                    .target
                    .as_ref()
                    .ok_or_else(|| Error::validation("sidecar restore requires a target"))?;
                let namespace = session.namespace().unwrap_or_default();
                ctx.notifier
                    .notify(&target.target_ref.kind, &namespace, &target.target_ref.name)
                    .await?;
                metrics::WORKLOAD_NOTIFICATIONS.with_label_values(&["inject"]).inc();
                Ok(LaunchOutcome::running(format!(
                    "restore init-container requested for {} {}",
                    target.target_ref.kind, target.target_ref.name
                )))
            }
            LaunchStrategy::VolumeSnapshot => {
                let job = ensure_volume_snapshot_restore_job(session, ctx).await?;
                Ok(LaunchOutcome::running(format!(
                    "volume snapshot restore job {} created",
                    job
                )))
            }
        }
    }
}

fn owner_of(session: &RestoreSession) -> Result<OwnerReference> {
    session
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation(format!("restoresession {} has no uid", session.name_any())))
}

fn record_job(outcome: EnsureOutcome, strategy: LaunchStrategy) {
    if outcome == EnsureOutcome::Created {
        metrics::JOBS_CREATED
            .with_label_values(&[strategy.as_str()])
            .inc();
    }
}

/// Resolve the session's Task and ensure the restore job with everything it needs.
///
/// Returns the job name.
pub async fn ensure_restore_job(session: &RestoreSession, ctx: &Context) -> Result<String> {
    let client = &ctx.client;
    let name = session.name_any();
    let namespace = session
        .namespace()
        .ok_or_else(|| Error::validation(format!("restoresession {} has no namespace", name)))?;
    let owner = owner_of(session)?;
    let labels = session.offshoot_labels();
    let job_name = restore_job_name(&name);

    let repo_ns = session.repository_namespace();
    let repo_name = &session.spec.repository.name;
    let repositories: Api<Repository> = Api::namespaced(client.clone(), &repo_ns);
    let repository = repositories
        .get(repo_name)
        .await
        .map_err(|e| not_found_as(e, format!("repository {}/{}", repo_ns, repo_name)))?;

    let task = ResolvedTask::fetch(client, &session.spec.task.name).await?;
    let psps = task.psp_names(&ctx.config.restore_job_psp_names);

    let provided_sa = session
        .spec
        .runtime_settings
        .pod
        .as_ref()
        .and_then(|p| p.service_account_name.clone())
        .filter(|sa| !sa.is_empty());
    let service_account = match provided_sa {
        Some(sa) => sa,
        None => {
            ensure_service_account(client, &job_name, &namespace, &owner, &labels).await?;
            job_name.clone()
        }
    };

    let identity = JobIdentity {
        owner: &owner,
        namespace: &namespace,
        service_account: &service_account,
        labels: &labels,
    };
    ensure_restore_job_rbac(client, &identity, &psps).await?;

    if reads_foreign_repository(session) {
        let subject = RepoReaderSubject {
            job: &job_name,
            namespace: &namespace,
            service_account: &service_account,
        };
        ensure_repo_reader_rbac(client, &repository, &subject, &labels).await?;
    }

    let inputs = merge_inputs(
        &session.explicit_inputs(),
        &implicit_inputs(&repository, session, ctx.config.enable_status_subresource)?,
    );

    let mut runtime_settings = session.spec.runtime_settings.clone();
    let pod_settings = runtime_settings.pod.get_or_insert_with(Default::default);
    pod_settings.security_context = Some(upsert_pod_security_context(
        default_restore_security_context(),
        pod_settings.security_context.take(),
    )?);
    pod_settings.service_account_name = Some(service_account.clone());

    let mut pod_spec = TaskResolver {
        task: &task,
        inputs: &inputs,
        runtime_settings: &runtime_settings,
        temp_dir: session.spec.temp_dir.as_ref(),
    }
    .pod_spec()?;
    if let Some(local) = &repository.spec.backend.local {
        attach_local_backend(&mut pod_spec, local);
    }

    let mut job_labels = labels.clone();
    job_labels.insert(DELETE_JOB_ON_COMPLETION_LABEL.to_string(), "false".to_string());
    let outcome = ensure_job(client, &job_name, &namespace, &owner, &job_labels, pod_spec).await?;
    record_job(outcome, LaunchStrategy::StandardJob);
    info!(job = %job_name, namespace = %namespace, ?outcome, "Ensured restore job");
    Ok(job_name)
}

/// Pod of the volume snapshot restore job
pub fn volume_snapshot_restore_pod_spec(session: &str, config: &OperatorConfig) -> PodSpec {
    PodSpec {
        containers: vec![Container {
            name: "restore-vs".to_string(),
            image: Some(config.operator_image()),
            image_pull_policy: Some("Always".to_string()),
            args: Some(vec![
                "restore-vs".to_string(),
                format!("--restoresession.name={}", session),
                format!("--enable-status-subresource={}", config.enable_status_subresource),
                format!("--enable-analytics={}", config.enable_analytics),
            ]),
            ..Default::default()
        }],
        restart_policy: Some("Never".to_string()),
        service_account_name: Some(session.to_string()),
        ..Default::default()
    }
}

/// Ensure the volume snapshot restore job with its identity and roles.
///
/// Returns the job name.
pub async fn ensure_volume_snapshot_restore_job(session: &RestoreSession, ctx: &Context) -> Result<String> {
    let client = &ctx.client;
    let name = session.name_any();
    let namespace = session
        .namespace()
        .ok_or_else(|| Error::validation(format!("restoresession {} has no namespace", name)))?;
    let owner = owner_of(session)?;
    let labels = session.offshoot_labels();
    let job_name = volume_snapshot_restore_job_name(&name);

    ensure_service_account(client, &name, &namespace, &owner, &labels).await?;
    let identity = JobIdentity {
        owner: &owner,
        namespace: &namespace,
        service_account: &name,
        labels: &labels,
    };
    ensure_volume_snapshot_restore_job_rbac(client, &identity).await?;

    let mut job_labels = labels.clone();
    job_labels.insert(DELETE_JOB_ON_COMPLETION_LABEL.to_string(), "true".to_string());
    let pod_spec = volume_snapshot_restore_pod_spec(&name, &ctx.config);
    let outcome = ensure_job(client, &job_name, &namespace, &owner, &job_labels, pod_spec).await?;
    record_job(outcome, LaunchStrategy::VolumeSnapshot);
    info!(job = %job_name, namespace = %namespace, ?outcome, "Ensured volume snapshot restore job");
    Ok(job_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{RestoreTarget, TargetRef};

    fn spec(kind: Option<&str>, driver: RestoreDriver) -> RestoreSessionSpec {
        RestoreSessionSpec {
            target: kind.map(|k| RestoreTarget {
                target_ref: TargetRef {
                    api_version: "apps/v1".to_string(),
                    kind: k.to_string(),
                    name: "pg".to_string(),
                },
                ..Default::default()
            }),
            driver,
            ..Default::default()
        }
    }

    #[test]
    fn strategy_selection() {
        assert_eq!(
            LaunchStrategy::select(&spec(None, RestoreDriver::StandardJob)),
            LaunchStrategy::StandardJob
        );
        assert_eq!(
            LaunchStrategy::select(&spec(Some("StatefulSet"), RestoreDriver::StandardJob)),
            LaunchStrategy::SidecarInjection
        );
        assert_eq!(
            LaunchStrategy::select(&spec(Some("StatefulSet"), RestoreDriver::VolumeSnapshotter)),
            LaunchStrategy::VolumeSnapshot
        );
        assert_eq!(
            LaunchStrategy::select(&spec(Some("PersistentVolumeClaim"), RestoreDriver::StandardJob)),
            LaunchStrategy::StandardJob
        );
        // snapshot driver without a target has nothing to snapshot into
        assert_eq!(
            LaunchStrategy::select(&spec(None, RestoreDriver::VolumeSnapshotter)),
            LaunchStrategy::StandardJob
        );
    }

    #[test]
    fn volume_snapshot_pod_runs_operator_image() {
        let config = OperatorConfig {
            image_tag: "v0.4.0".to_string(),
            enable_analytics: true,
            ..Default::default()
        };
        let pod = volume_snapshot_restore_pod_spec("pg-restore", &config);
        assert_eq!(pod.service_account_name.as_deref(), Some("pg-restore"));
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("osodevops/backup-restore-operator:v0.4.0")
        );
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec![
                "restore-vs".to_string(),
                "--restoresession.name=pg-restore".to_string(),
                "--enable-status-subresource=true".to_string(),
                "--enable-analytics=true".to_string(),
            ]
        );
    }
}
