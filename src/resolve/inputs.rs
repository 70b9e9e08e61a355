//! Task inputs
//!
//! Explicit inputs come from the session's task parameters. Implicit inputs
//! are derived from the repository and the session and always win over
//! explicit ones.

use std::collections::BTreeMap;

use kube::ResourceExt;

use super::rules::restore_options_for_host;
use crate::crd::{Repository, RestoreSession};
use crate::error::{Error, Result};

pub const REPOSITORY_PROVIDER: &str = "REPOSITORY_PROVIDER";
pub const REPOSITORY_BUCKET: &str = "REPOSITORY_BUCKET";
pub const REPOSITORY_PREFIX: &str = "REPOSITORY_PREFIX";
pub const REPOSITORY_ENDPOINT: &str = "REPOSITORY_ENDPOINT";
pub const REPOSITORY_URL: &str = "REPOSITORY_URL";
pub const REPOSITORY_SECRET_NAME: &str = "REPOSITORY_SECRET_NAME";
pub const MAX_CONNECTIONS: &str = "MAX_CONNECTIONS";
pub const HOSTNAME: &str = "HOSTNAME";
pub const SOURCE_HOSTNAME: &str = "SOURCE_HOSTNAME";
pub const RESTORE_PATHS: &str = "RESTORE_PATHS";
pub const RESTORE_SNAPSHOTS: &str = "RESTORE_SNAPSHOTS";
pub const ENABLE_CACHE: &str = "ENABLE_CACHE";
pub const NAMESPACE: &str = "NAMESPACE";
pub const RESTORE_SESSION: &str = "RESTORE_SESSION";
pub const STATUS_SUBRESOURCE_ENABLED: &str = "STATUS_SUBRESOURCE_ENABLED";

/// Host name used by a job restoring a single host
pub const DEFAULT_HOST: &str = "host-0";

/// Inputs describing the repository backend
pub fn inputs_for_repository(repository: &Repository) -> Result<BTreeMap<String, String>> {
    let backend = &repository.spec.backend;
    let provider = backend.provider().ok_or_else(|| {
        Error::validation(format!(
            "repository {}/{} has no backend provider",
            repository.namespace().unwrap_or_default(),
            repository.name_any()
        ))
    })?;
    let (bucket, prefix) = backend.bucket_and_prefix();

    let mut inputs = BTreeMap::new();
    inputs.insert(REPOSITORY_PROVIDER.to_string(), provider.to_string());
    inputs.insert(REPOSITORY_BUCKET.to_string(), bucket);
    inputs.insert(REPOSITORY_PREFIX.to_string(), prefix);
    inputs.insert(REPOSITORY_ENDPOINT.to_string(), backend.endpoint());
    inputs.insert(REPOSITORY_URL.to_string(), backend.rest_url());
    inputs.insert(
        REPOSITORY_SECRET_NAME.to_string(),
        backend.storage_secret_name.clone(),
    );
    if let Some(max) = backend.max_connections() {
        inputs.insert(MAX_CONNECTIONS.to_string(), max.to_string());
    }
    Ok(inputs)
}

/// Inputs describing what the session restores on the job's host
pub fn inputs_for_restore_session(session: &RestoreSession) -> BTreeMap<String, String> {
    let mut inputs = BTreeMap::new();
    inputs.insert(HOSTNAME.to_string(), DEFAULT_HOST.to_string());

    if let Some(opts) = restore_options_for_host(DEFAULT_HOST, &session.spec.rules) {
        inputs.insert(SOURCE_HOSTNAME.to_string(), opts.source_host);
        inputs.insert(RESTORE_PATHS.to_string(), opts.paths.join(","));
        inputs.insert(RESTORE_SNAPSHOTS.to_string(), opts.snapshots.join(","));
    }

    let caching = !session
        .spec
        .temp_dir
        .as_ref()
        .map(|t| t.disable_caching)
        .unwrap_or(false);
    inputs.insert(ENABLE_CACHE.to_string(), caching.to_string());
    inputs
}

/// Every implicit input of a standard restore job
pub fn implicit_inputs(
    repository: &Repository,
    session: &RestoreSession,
    status_subresource_enabled: bool,
) -> Result<BTreeMap<String, String>> {
    let mut inputs = inputs_for_repository(repository)?;
    inputs.extend(inputs_for_restore_session(session));
    inputs.insert(NAMESPACE.to_string(), session.namespace().unwrap_or_default());
    inputs.insert(RESTORE_SESSION.to_string(), session.name_any());
    inputs.insert(
        STATUS_SUBRESOURCE_ENABLED.to_string(),
        status_subresource_enabled.to_string(),
    );
    Ok(inputs)
}

/// Apply `implicit` over `explicit`; implicit values win on collision
pub fn merge_inputs(
    explicit: &BTreeMap<String, String>,
    implicit: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = explicit.clone();
    merged.extend(implicit.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
