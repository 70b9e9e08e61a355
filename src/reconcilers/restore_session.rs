//! RestoreSession reconciler
//!
//! Every pass re-derives what to do from the stored status, so running it any
//! number of times for the same state has the effect of running it once.

use kube::{
    api::{Patch, PatchParams},
    runtime::controller::Action,
    Api, ResourceExt,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::launch::LaunchStrategy;
use super::phase::{compute_phase, session_duration};
use crate::controllers::Context;
use crate::crd::{RestoreDriver, RestoreSession, RestoreSessionPhase, RestoreSessionStatus};
use crate::error::Result;
use crate::events::{transition_event, EventPublisher};
use crate::metrics;
use crate::rbac::{delete_storage_class_bindings, ensure_repo_reader_binding_deleted, reads_foreign_repository};
use crate::resources::restore_job_name;
use crate::workload::{total_hosts, uses_sidecar_model, WorkloadNotifier};

/// Where a session is in its deletion lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizerState {
    /// Not being deleted
    Active,
    /// Deletion requested, cleanup still owed
    PendingCleanup,
    /// Deletion requested and cleanup done
    Removable,
}

impl FinalizerState {
    /// State of `session` with respect to `finalizer`
    pub fn of(session: &RestoreSession, finalizer: &str) -> Self {
        let has_finalizer = session.finalizers().iter().any(|f| f == finalizer);
        match (session.metadata.deletion_timestamp.is_some(), has_finalizer) {
            (false, _) => FinalizerState::Active,
            (true, true) => FinalizerState::PendingCleanup,
            (true, false) => FinalizerState::Removable,
        }
    }
}

/// What a pass does for a session that is not being deleted
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do
    Skip { reason: String },
    /// A host failed
    MarkFailed { error: String },
    /// A host outcome is unknown
    MarkUnknown { error: String },
    /// Every host succeeded
    MarkSucceeded { session_duration: String },
    /// Start the restore
    Launch(LaunchStrategy),
}

/// Decide what to do for `session`.
///
/// Fails only when every host succeeded but a host duration cannot be parsed.
pub fn decide(session: &RestoreSession) -> Result<Decision> {
    let stored = session.phase();
    if let Some(phase) = stored.filter(|p| p.is_terminal()) {
        return Ok(Decision::Skip {
            reason: format!("restore session already {}", phase),
        });
    }

    let status = session.status.clone().unwrap_or_default();
    let (phase, error) = compute_phase(&status);
    if phase == RestoreSessionPhase::Unknown && stored == Some(phase) {
        return Ok(Decision::Skip {
            reason: format!("restore session already {}", phase),
        });
    }

    Ok(match phase {
        RestoreSessionPhase::Failed => Decision::MarkFailed {
            error: error.unwrap_or_default(),
        },
        RestoreSessionPhase::Unknown => Decision::MarkUnknown {
            error: error.unwrap_or_default(),
        },
        RestoreSessionPhase::Succeeded => Decision::MarkSucceeded {
            session_duration: session_duration(&status.stats)?,
        },
        RestoreSessionPhase::Running => Decision::Skip {
            reason: "restore session is running".to_string(),
        },
        RestoreSessionPhase::Pending => Decision::Launch(LaunchStrategy::select(&session.spec)),
    })
}

/// Merge patch turning `current` into `desired`, touching only changed
/// top-level status fields. `None` when nothing changed.
pub fn status_merge_patch(
    current: &RestoreSessionStatus,
    desired: &RestoreSessionStatus,
) -> Result<Option<Value>> {
    let before = as_object(serde_json::to_value(current)?);
    let after = as_object(serde_json::to_value(desired)?);

    let mut changed = Map::new();
    for (key, value) in &after {
        if before.get(key) != Some(value) {
            changed.insert(key.clone(), value.clone());
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            changed.insert(key.clone(), Value::Null);
        }
    }

    if changed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(json!({ "status": changed })))
    }
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Apply `transform` to the last read status and persist the difference
pub async fn update_status<F>(ctx: &Context, session: &RestoreSession, transform: F) -> Result<()>
where
    F: FnOnce(RestoreSessionStatus) -> RestoreSessionStatus,
{
    let current = session.status.clone().unwrap_or_default();
    let desired = transform(current.clone());
    let Some(patch) = status_merge_patch(&current, &desired)? else {
        return Ok(());
    };

    let namespace = session.namespace().unwrap_or_default();
    let name = session.name_any();
    let api: Api<RestoreSession> = Api::namespaced(ctx.client.clone(), &namespace);
    let params = PatchParams::default();
    if ctx.config.enable_status_subresource {
        api.patch_status(&name, &params, &Patch::Merge(&patch)).await?;
    } else {
        api.patch(&name, &params, &Patch::Merge(&patch)).await?;
    }
    Ok(())
}

async fn record_transition(
    events: &dyn EventPublisher,
    session: &RestoreSession,
    phase: RestoreSessionPhase,
    detail: &str,
) {
    metrics::PHASE_TRANSITIONS
        .with_label_values(&[phase.as_str()])
        .inc();
    let Some(event) = transition_event(phase, Some(detail)) else {
        return;
    };
    if let Err(e) = events.publish(session, event).await {
        warn!(name = %session.name_any(), error = %e, "Failed to record event");
    }
}

async fn transition(
    ctx: &Context,
    session: &RestoreSession,
    phase: RestoreSessionPhase,
    detail: &str,
    transform: impl FnOnce(RestoreSessionStatus) -> RestoreSessionStatus,
) -> Result<()> {
    let generation = session.metadata.generation;
    update_status(ctx, session, |status| {
        let mut status = transform(status);
        status.phase = Some(phase);
        status.observed_generation = generation;
        status
    })
    .await?;
    info!(name = %session.name_any(), phase = %phase, "Restore session phase updated");
    record_transition(ctx.events.as_ref(), session, phase, detail).await;
    Ok(())
}

/// Reconcile a session that is not being deleted
pub async fn apply(session: &RestoreSession, ctx: &Context) -> Result<Action> {
    let name = session.name_any();
    let namespace = session.namespace().unwrap_or_default();

    match decide(session)? {
        Decision::Skip { reason } => {
            info!(name = %name, namespace = %namespace, reason = %reason, "Skipping restore session");
        }
        Decision::MarkFailed { error } => {
            transition(ctx, session, RestoreSessionPhase::Failed, &error, |s| s).await?;
        }
        Decision::MarkUnknown { error } => {
            transition(ctx, session, RestoreSessionPhase::Unknown, &error, |s| s).await?;
        }
        Decision::MarkSucceeded { session_duration } => {
            let duration = session_duration.clone();
            transition(ctx, session, RestoreSessionPhase::Succeeded, &session_duration, |mut s| {
                s.session_duration = Some(duration);
                s
            })
            .await?;
        }
        Decision::Launch(strategy) => {
            info!(name = %name, namespace = %namespace, strategy = strategy.as_str(), "Launching restore");
            let current_total = session.status.as_ref().and_then(|s| s.total_hosts);
            let total = match current_total {
                Some(total) => total,
                None => {
                    total_hosts(
                        &ctx.client,
                        session.spec.target.as_ref(),
                        &namespace,
                        session.spec.driver,
                    )
                    .await?
                }
            };

            let outcome = strategy.launch(session, ctx).await?;
            transition(ctx, session, outcome.phase, &outcome.message, |mut s| {
                if s.total_hosts.is_none() {
                    s.total_hosts = Some(total);
                }
                s
            })
            .await?;
        }
    }
    Ok(Action::await_change())
}

/// Ask the workload controller to remove the restore init-container.
///
/// An absent workload has nothing to remove. Any other failure is returned so
/// the finalizer stays until the request gets through.
pub async fn retract_injection(session: &RestoreSession, notifier: &dyn WorkloadNotifier) -> Result<()> {
    let target = match session.spec.target.as_ref() {
        Some(target) if uses_sidecar_model(Some(target)) => target,
        _ => return Ok(()),
    };
    let namespace = session.namespace().unwrap_or_default();
    match notifier
        .notify(&target.target_ref.kind, &namespace, &target.target_ref.name)
        .await
    {
        Ok(()) => {
            metrics::WORKLOAD_NOTIFICATIONS.with_label_values(&["retract"]).inc();
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            info!(
                kind = %target.target_ref.kind,
                name = %target.target_ref.name,
                "Target workload is gone, nothing to retract"
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Retract every side effect the session has outside its owned objects
pub async fn cleanup(session: &RestoreSession, ctx: &Context) -> Result<Action> {
    let name = session.name_any();
    let namespace = session.namespace().unwrap_or_default();
    info!(name = %name, namespace = %namespace, "Cleaning up RestoreSession");

    retract_injection(session, ctx.notifier.as_ref()).await?;

    if reads_foreign_repository(session) {
        let job_meta = ObjectMeta {
            name: Some(restore_job_name(&name)),
            namespace: Some(namespace.clone()),
            labels: Some(session.offshoot_labels()),
            ..Default::default()
        };
        ensure_repo_reader_binding_deleted(&ctx.client, &job_meta).await?;
    }

    if session.spec.driver == RestoreDriver::VolumeSnapshotter && session.spec.target.is_some() {
        delete_storage_class_bindings(&ctx.client, &name, &namespace).await?;
    }

    metrics::CLEANUPS.inc();
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{HostRestorePhase, HostRestoreStats, RestoreSessionSpec};

    fn session(status: Option<RestoreSessionStatus>) -> RestoreSession {
        let mut rs = RestoreSession::new("pg-restore", RestoreSessionSpec::default());
        rs.metadata.namespace = Some("demo".to_string());
        rs.status = status;
        rs
    }

    fn host(name: &str, phase: HostRestorePhase, duration: &str) -> HostRestoreStats {
        HostRestoreStats {
            hostname: name.to_string(),
            phase,
            duration: Some(duration.to_string()),
            error: None,
        }
    }

    fn running(total: i32, stats: Vec<HostRestoreStats>) -> RestoreSessionStatus {
        RestoreSessionStatus {
            phase: Some(RestoreSessionPhase::Running),
            total_hosts: Some(total),
            stats,
            ..Default::default()
        }
    }

    #[test]
    fn finalizer_states() {
        let mut rs = session(None);
        assert_eq!(FinalizerState::of(&rs, "f"), FinalizerState::Active);

        rs.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
        assert_eq!(FinalizerState::of(&rs, "f"), FinalizerState::Removable);

        rs.metadata.finalizers = Some(vec!["f".to_string()]);
        assert_eq!(FinalizerState::of(&rs, "f"), FinalizerState::PendingCleanup);
    }

    #[test]
    fn new_session_is_launched() {
        assert_eq!(
            decide(&session(None)).unwrap(),
            Decision::Launch(LaunchStrategy::StandardJob)
        );
    }

    #[test]
    fn terminal_sessions_are_skipped() {
        for phase in [RestoreSessionPhase::Succeeded, RestoreSessionPhase::Failed] {
            let mut status = running(1, vec![host("host-0", HostRestorePhase::Failed, "1s")]);
            status.phase = Some(phase);
            assert!(matches!(
                decide(&session(Some(status))).unwrap(),
                Decision::Skip { .. }
            ));
        }
    }

    #[test]
    fn running_session_waits_for_hosts() {
        let status = running(3, vec![host("host-0", HostRestorePhase::Succeeded, "1s")]);
        assert!(matches!(
            decide(&session(Some(status))).unwrap(),
            Decision::Skip { .. }
        ));
    }

    #[test]
    fn unknown_is_not_recorded_twice() {
        let mut status = running(1, vec![host("host-0", HostRestorePhase::Unknown, "1s")]);
        assert!(matches!(
            decide(&session(Some(status.clone()))).unwrap(),
            Decision::MarkUnknown { .. }
        ));
        status.phase = Some(RestoreSessionPhase::Unknown);
        assert!(matches!(
            decide(&session(Some(status))).unwrap(),
            Decision::Skip { .. }
        ));
    }

    #[test]
    fn success_carries_summed_duration() {
        let status = running(
            2,
            vec![
                host("host-0", HostRestorePhase::Succeeded, "1m"),
                host("host-1", HostRestorePhase::Succeeded, "2m30s"),
            ],
        );
        assert_eq!(
            decide(&session(Some(status))).unwrap(),
            Decision::MarkSucceeded {
                session_duration: "3m30s".to_string()
            }
        );
    }

    #[test]
    fn malformed_duration_aborts_success() {
        let status = running(1, vec![host("host-0", HostRestorePhase::Succeeded, "fast")]);
        assert!(decide(&session(Some(status))).is_err());
    }

    #[test]
    fn status_patch_touches_changed_fields_only() {
        let current = running(3, vec![host("host-0", HostRestorePhase::Succeeded, "1s")]);
        let mut desired = current.clone();
        desired.phase = Some(RestoreSessionPhase::Failed);

        let patch = status_merge_patch(&current, &desired).unwrap().unwrap();
        let status = patch["status"].as_object().unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status["phase"], "Failed");

        assert!(status_merge_patch(&current, &current).unwrap().is_none());
    }

    #[test]
    fn status_patch_nulls_removed_fields() {
        let mut current = running(1, vec![]);
        current.session_duration = Some("1s".to_string());
        let mut desired = current.clone();
        desired.session_duration = None;

        let patch = status_merge_patch(&current, &desired).unwrap().unwrap();
        assert!(patch["status"]["sessionDuration"].is_null());
        assert!(patch["status"].as_object().unwrap().contains_key("sessionDuration"));
    }
}
