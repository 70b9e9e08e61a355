//! Operator configuration from environment variables

use std::collections::HashMap;

use crate::error::{Error, Result};

const ENV_KEYS: [&str; 10] = [
    "METRICS_PORT",
    "WORKER_THREADS",
    "MAX_NUM_REQUEUES",
    "DOCKER_REGISTRY",
    "OPERATOR_IMAGE",
    "OPERATOR_IMAGE_TAG",
    "ENABLE_STATUS_SUBRESOURCE",
    "ENABLE_ANALYTICS",
    "RESTORE_JOB_PSP_NAMES",
    "WATCH_NAMESPACE",
];

/// Operator configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Port of the metrics, probe and admission server
    pub metrics_port: u16,
    /// Maximum number of sessions reconciled concurrently
    pub worker_threads: u16,
    /// Consecutive failures after which a session stops being retried
    pub max_num_requeues: u32,
    /// Registry of the operator image
    pub docker_registry: String,
    /// Operator image name
    pub image: String,
    /// Operator image tag
    pub image_tag: String,
    /// Whether RestoreSession status is a subresource
    pub enable_status_subresource: bool,
    /// Forwarded to volume snapshot restore jobs
    pub enable_analytics: bool,
    /// Pod security policies restore jobs may use
    pub restore_job_psp_names: Vec<String>,
    /// Only watch this namespace when set
    pub watch_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            metrics_port: 8080,
            worker_threads: 2,
            max_num_requeues: 5,
            docker_registry: "osodevops".to_string(),
            image: "backup-restore-operator".to_string(),
            image_tag: env!("CARGO_PKG_VERSION").to_string(),
            enable_status_subresource: true,
            enable_analytics: false,
            restore_job_psp_names: Vec::new(),
            watch_namespace: None,
        }
    }
}

impl OperatorConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    /// Build the configuration from a map of variables; missing ones take defaults
    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| {
            envs.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(Self {
            metrics_port: parse_or(get("METRICS_PORT"), "METRICS_PORT", defaults.metrics_port)?,
            worker_threads: parse_or(get("WORKER_THREADS"), "WORKER_THREADS", defaults.worker_threads)?,
            max_num_requeues: parse_or(
                get("MAX_NUM_REQUEUES"),
                "MAX_NUM_REQUEUES",
                defaults.max_num_requeues,
            )?,
            docker_registry: get("DOCKER_REGISTRY").unwrap_or(defaults.docker_registry),
            image: get("OPERATOR_IMAGE").unwrap_or(defaults.image),
            image_tag: get("OPERATOR_IMAGE_TAG").unwrap_or(defaults.image_tag),
            enable_status_subresource: parse_bool_or(
                get("ENABLE_STATUS_SUBRESOURCE"),
                "ENABLE_STATUS_SUBRESOURCE",
                defaults.enable_status_subresource,
            )?,
            enable_analytics: parse_bool_or(
                get("ENABLE_ANALYTICS"),
                "ENABLE_ANALYTICS",
                defaults.enable_analytics,
            )?,
            restore_job_psp_names: get("RESTORE_JOB_PSP_NAMES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            watch_namespace: get("WATCH_NAMESPACE"),
        })
    }

    /// Image of the volume snapshot restore job
    pub fn operator_image(&self) -> String {
        format!("{}/{}:{}", self.docker_registry, self.image, self.image_tag)
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> Result<T> {
    match value {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| Error::config(format!("invalid {}='{}'", key, v))),
    }
}

fn parse_bool_or(value: Option<String>, key: &str, default: bool) -> Result<bool> {
    match value.map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(Error::config(format!(
                "invalid {}='{}'. expected true or false",
                key, v
            ))),
        },
    }
}
