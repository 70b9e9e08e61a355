//! Error types for the Backup Restore Operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Referenced object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Failure provisioning objects a job depends on
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// Task template resolution error
    #[error("Resolve error: {0}")]
    Resolve(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed host duration
    #[error("Invalid duration: {0}")]
    Duration(String),

    /// Workload notification could not be delivered
    #[error("Workload notification failed: {0}")]
    Notify(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl Error {
    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a dependency error
    pub fn dependency(msg: impl Into<String>) -> Self {
        Error::Dependency(msg.into())
    }

    /// Create a resolve error
    pub fn resolve(msg: impl Into<String>) -> Self {
        Error::Resolve(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Whether the error means the referenced object is absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Whether retrying the same pass may succeed.
    ///
    /// API client errors (4xx) are deterministic for an immutable spec and
    /// are not worth a retry, except timeouts (408), conflicts with a
    /// concurrent writer (409) and throttling (429). Server errors, transport
    /// failures, failed notifications and unmet dependencies are retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => {
                matches!(resp.code, 408 | 409 | 429) || !(400..500).contains(&resp.code)
            }
            Error::Kube(_) | Error::Notify(_) | Error::Dependency(_) => true,
            Error::Finalizer(inner) => match inner.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(e)
                | kube::runtime::finalizer::Error::CleanupFailed(e) => e.is_transient(),
                _ => true,
            },
            _ => false,
        }
    }
}

/// Map a kube 404 into [`Error::NotFound`] naming the object
pub(crate) fn not_found_as(err: kube::Error, what: impl Into<String>) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(what.into()),
        other => Error::Kube(other),
    }
}
