//! Kubernetes controller for RestoreSession
//!
//! Watches RestoreSession resources and hands each change to the reconciler.

mod restore_session_controller;

pub use restore_session_controller::{run as run_restore_session_controller, FINALIZER_NAME};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::Client;

use crate::config::OperatorConfig;
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::workload::{AnnotationNotifier, WorkloadNotifier};

/// First retry delay after a failed reconciliation
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

/// Longest retry delay
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(300);

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator configuration
    pub config: OperatorConfig,
    /// Channel to workload controllers
    pub notifier: Arc<dyn WorkloadNotifier>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Consecutive failures per session
    pub retries: RetryTracker,
}

impl Context {
    /// Create a context talking to the API server for every collaborator
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let notifier = Arc::new(AnnotationNotifier::new(client.clone()));
        let events = Arc::new(KubeEventPublisher::new(client.clone()));
        Self::with_collaborators(client, config, notifier, events)
    }

    /// Create a context with explicit collaborators
    pub fn with_collaborators(
        client: Client,
        config: OperatorConfig,
        notifier: Arc<dyn WorkloadNotifier>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            client,
            config,
            notifier,
            events,
            retries: RetryTracker::default(),
        }
    }
}

/// Counts consecutive reconciliation failures per object key
#[derive(Debug, Default)]
pub struct RetryTracker {
    failures: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    /// Record a failure of `key`, returning the number of consecutive failures
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset `key` after a successful pass
    pub fn forget(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Delay before retry number `attempt` (1-based): doubling from
/// [`RETRY_BASE_DELAY`] up to [`RETRY_MAX_DELAY`]
pub fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    RETRY_BASE_DELAY
        .saturating_mul(1u32 << exp)
        .min(RETRY_MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(backoff(1), Duration::from_secs(5));
        assert_eq!(backoff(2), Duration::from_secs(10));
        assert_eq!(backoff(4), Duration::from_secs(40));
        assert_eq!(backoff(7), Duration::from_secs(300));
        assert_eq!(backoff(100), Duration::from_secs(300));
    }

    #[test]
    fn tracker_counts_until_forgotten() {
        let tracker = RetryTracker::default();
        assert_eq!(tracker.record_failure("demo/pg"), 1);
        assert_eq!(tracker.record_failure("demo/pg"), 2);
        assert_eq!(tracker.record_failure("demo/mysql"), 1);
        tracker.forget("demo/pg");
        assert_eq!(tracker.record_failure("demo/pg"), 1);
    }
}
