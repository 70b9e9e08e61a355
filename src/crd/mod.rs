//! Custom Resource Definitions for the Backup Restore Operator

mod repository;
mod restore_session;
mod task;

pub use repository::*;
pub use restore_session::*;
pub use task::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![
        serde_yaml::to_string(&RestoreSession::crd())?,
        serde_yaml::to_string(&Repository::crd())?,
        serde_yaml::to_string(&Task::crd())?,
        serde_yaml::to_string(&Function::crd())?,
    ])
}
