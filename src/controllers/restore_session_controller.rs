//! RestoreSession controller
//!
//! Watches RestoreSession resources and triggers reconciliation.

use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::{self, Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector::ObjectRef,
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::backoff;
use crate::controllers::Context;
use crate::crd::RestoreSession;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::restore_session::{self as session_reconciler, FinalizerState};

/// Finalizer name for RestoreSession resources
pub const FINALIZER_NAME: &str = "backup.oso.sh/restore-session-finalizer";

/// Run the RestoreSession controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<RestoreSession> = match context.config.watch_namespace.as_deref() {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("RestoreSession CRD not installed: {}", e);
        return;
    }

    let concurrency = context.config.worker_threads;
    info!(concurrency, "Starting RestoreSession controller");

    Controller::new(api, WatcherConfig::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled RestoreSession"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS
                        .with_label_values(&["RestoreSession"])
                        .inc();
                }
            }
        })
        .await;
}

fn retry_key(obj: &RestoreSession) -> String {
    ObjectRef::from_obj(obj).to_string()
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<RestoreSession>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&["RestoreSession"])
        .start_timer();
    metrics::RECONCILIATIONS
        .with_label_values(&["RestoreSession"])
        .inc();

    let key = retry_key(&obj);
    if FinalizerState::of(&obj, FINALIZER_NAME) == FinalizerState::Removable {
        debug!("RestoreSession is being deleted and already cleaned up");
        ctx.retries.forget(&key);
        return Ok(Action::await_change());
    }

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<RestoreSession> = Api::namespaced(ctx.client.clone(), &namespace);

    let action = finalizer(&api, FINALIZER_NAME, obj, |event| async {
        match event {
            FinalizerEvent::Apply(session) => session_reconciler::apply(&session, &ctx).await,
            FinalizerEvent::Cleanup(session) => session_reconciler::cleanup(&session, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))?;

    ctx.retries.forget(&key);
    Ok(action)
}

/// Error policy for the controller.
///
/// Retries with a doubling delay until the configured number of requeues is
/// spent, then waits for the next change to the session.
fn error_policy(obj: Arc<RestoreSession>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let attempt = ctx.retries.record_failure(&retry_key(&obj));

    if attempt > ctx.config.max_num_requeues {
        warn!(
            name = %name,
            error = %error,
            attempts = attempt,
            "Dropping RestoreSession after repeated failures"
        );
        metrics::RETRIES_DROPPED.inc();
        ctx.retries.forget(&retry_key(&obj));
        return Action::await_change();
    }

    let delay = backoff(attempt);
    error!(
        name = %name,
        error = %error,
        transient = error.is_transient(),
        attempt,
        retry_in_secs = delay.as_secs(),
        "Reconciliation failed, scheduling retry"
    );
    Action::requeue(delay)
}
