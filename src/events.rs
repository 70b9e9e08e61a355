//! Event records for RestoreSession phase transitions
//!
//! Events are published through `kube::runtime::events::Recorder`, which
//! folds repeats of the same event into an event series.

use async_trait::async_trait;
use kube::runtime::events::{Event, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::debug;

pub use kube::runtime::events::EventType;

use crate::crd::{RestoreSession, RestoreSessionPhase};
use crate::error::Result;

/// Controller name reported on every event
pub const EVENT_SOURCE: &str = "restore-session-controller";

/// Reason codes
pub mod reasons {
    pub const RESTORE_SESSION_RUNNING: &str = "RestoreSessionRunning";
    pub const RESTORE_SESSION_SUCCEEDED: &str = "RestoreSessionSucceeded";
    pub const RESTORE_SESSION_FAILED: &str = "RestoreSessionFailed";
    pub const RESTORE_PHASE_UNKNOWN: &str = "RestorePhaseUnknown";
}

/// Action strings
pub mod actions {
    /// Session phase changed
    pub const PHASE_TRANSITION: &str = "PhaseTransition";
}

/// An event about a RestoreSession
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEvent {
    pub type_: EventType,
    pub reason: &'static str,
    pub message: String,
}

impl SessionEvent {
    /// Event in the form the recorder publishes
    pub fn to_recorder_event(&self) -> Event {
        Event {
            type_: self.type_,
            reason: self.reason.to_string(),
            note: Some(self.message.clone()),
            action: actions::PHASE_TRANSITION.to_string(),
            secondary: None,
        }
    }
}

/// Event recorded when a session enters `phase`; Pending records none
pub fn transition_event(phase: RestoreSessionPhase, detail: Option<&str>) -> Option<SessionEvent> {
    let detail = detail.unwrap_or_default();
    let (type_, reason, message) = match phase {
        RestoreSessionPhase::Pending => return None,
        RestoreSessionPhase::Running => (
            EventType::Normal,
            reasons::RESTORE_SESSION_RUNNING,
            if detail.is_empty() {
                "restore session is running".to_string()
            } else {
                detail.to_string()
            },
        ),
        RestoreSessionPhase::Succeeded => (
            EventType::Normal,
            reasons::RESTORE_SESSION_SUCCEEDED,
            format!("restore session has succeeded. Duration: {}", detail),
        ),
        RestoreSessionPhase::Failed => (
            EventType::Warning,
            reasons::RESTORE_SESSION_FAILED,
            format!("restore session has failed. Reason: {}", detail),
        ),
        RestoreSessionPhase::Unknown => (
            EventType::Warning,
            reasons::RESTORE_PHASE_UNKNOWN,
            format!("restore session phase is unknown. Reason: {}", detail),
        ),
    };
    Some(SessionEvent {
        type_,
        reason,
        message,
    })
}

/// Sink for session events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` against `session`
    async fn publish(&self, session: &RestoreSession, event: SessionEvent) -> Result<()>;
}

/// Publishes events through the kube event recorder
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: EVENT_SOURCE.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, session: &RestoreSession, event: SessionEvent) -> Result<()> {
        self.recorder
            .publish(&event.to_recorder_event(), &session.object_ref(&()))
            .await?;
        debug!(reason = event.reason, name = %session.name_any(), "Recorded event");
        Ok(())
    }
}
