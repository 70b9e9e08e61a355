//! Admission validation for RestoreSession
//!
//! Rejects sessions that cannot be restored and any change to the spec of an
//! existing session.

use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{debug, warn};

use crate::crd::{RestoreDriver, RestoreSession, RestoreSessionSpec};
use crate::error::{Error, Result};
use crate::workload::uses_sidecar_model;

/// Path the admission endpoint is served on.
///
/// The operator serves it over plain HTTP next to the metrics. The API server
/// only calls webhooks over HTTPS, so TLS must be terminated in front of it
/// (a proxy sidecar or a service mesh).
pub const VALIDATE_PATH: &str = "/validate/restoresessions";

/// Check that a session can be restored
pub fn validate_restore_session(spec: &RestoreSessionSpec) -> Result<()> {
    if spec.repository.name.is_empty() {
        return Err(Error::validation("repository name must be specified"));
    }

    if let Some(target) = &spec.target {
        if target.target_ref.kind.is_empty() || target.target_ref.name.is_empty() {
            return Err(Error::validation("target ref kind and name must be specified"));
        }
    }

    match spec.driver {
        RestoreDriver::VolumeSnapshotter if spec.target.is_none() => {
            return Err(Error::validation(
                "a target must be specified for the VolumeSnapshotter driver",
            ));
        }
        RestoreDriver::VolumeSnapshotter => {}
        RestoreDriver::StandardJob => {
            if !uses_sidecar_model(spec.target.as_ref()) && spec.task.name.is_empty() {
                return Err(Error::validation("task name must be specified"));
            }
        }
    }

    for (i, rule) in spec.rules.iter().enumerate() {
        if rule.paths.is_empty() && rule.snapshots.is_empty() {
            return Err(Error::validation(format!(
                "rule {} must list paths or snapshots",
                i
            )));
        }
    }
    Ok(())
}

/// Reject any spec change on update
pub fn validate_update(old: &RestoreSessionSpec, new: &RestoreSessionSpec) -> Result<()> {
    if old != new {
        return Err(Error::validation("RestoreSession spec is immutable"));
    }
    Ok(())
}

/// Decide an admission request
pub fn admit(req: &AdmissionRequest<RestoreSession>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let verdict = match (&req.operation, &req.object, &req.old_object) {
        (Operation::Create, Some(obj), _) => validate_restore_session(&obj.spec),
        (Operation::Update, Some(obj), Some(old)) => {
            validate_update(&old.spec, &obj.spec).and_then(|_| validate_restore_session(&obj.spec))
        }
        _ => Ok(()),
    };

    match verdict {
        Ok(()) => {
            debug!(name = %req.name, operation = ?req.operation, "Admitted RestoreSession");
            response
        }
        Err(e) => {
            warn!(name = %req.name, operation = ?req.operation, error = %e, "Denied RestoreSession");
            response.deny(e.to_string())
        }
    }
}

/// Answer a serialized `AdmissionReview`
pub fn review(body: &[u8]) -> Result<Vec<u8>> {
    let review: AdmissionReview<RestoreSession> = serde_json::from_slice(body)?;
    let request: std::result::Result<AdmissionRequest<RestoreSession>, _> = review.try_into();
    let response = match request {
        Ok(req) => admit(&req),
        Err(e) => AdmissionResponse::invalid(e.to_string()),
    };
    Ok(serde_json::to_vec(&response.into_review())?)
}
