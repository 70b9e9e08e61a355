//! RestoreSession Custom Resource Definition

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, LocalObjectReference, PersistentVolumeClaim, PodSecurityContext,
    ResourceRequirements, SecurityContext, Toleration, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize};

/// Label key naming the RestoreSession an object was created for
pub const RESTORE_SESSION_LABEL: &str = "backup.oso.sh/restore-session";

/// Label key used by every object the operator creates
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY: &str = "backup-restore-operator";

/// RestoreSession resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "backup.oso.sh",
    version = "v1alpha1",
    kind = "RestoreSession",
    plural = "restoresessions",
    singular = "restoresession",
    shortname = "rs",
    namespaced,
    status = "RestoreSessionStatus",
    printcolumn = r#"{"name": "Repository", "type": "string", "jsonPath": ".spec.repository.name"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Hosts", "type": "integer", "jsonPath": ".status.totalHosts"}"#,
    printcolumn = r#"{"name": "Duration", "type": "string", "jsonPath": ".status.sessionDuration"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSessionSpec {
    /// Repository holding the backed up data
    pub repository: RepositoryRef,

    /// Target to restore into. Absent for non-workload targets restored by a job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<RestoreTarget>,

    /// Driver performing the restore
    #[serde(default)]
    pub driver: RestoreDriver,

    /// Per-host restore rules, evaluated in declared order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RestoreRule>,

    /// Task describing the restore job
    #[serde(default)]
    pub task: TaskRef,

    /// Runtime settings for the restore pod and containers
    #[serde(default)]
    pub runtime_settings: RuntimeSettings,

    /// Settings for the `/tmp` scratch volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<EmptyDirSettings>,
}

/// Reference to a Repository
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRef {
    /// Repository name
    pub name: String,
    /// Repository namespace, defaults to the session's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Restore driver
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RestoreDriver {
    /// Restore through a job (or an injected init-container for workloads)
    #[default]
    StandardJob,
    /// Restore volumes from CSI volume snapshots
    VolumeSnapshotter,
}

/// Restore target
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreTarget {
    /// Reference to the target object
    #[serde(rename = "ref")]
    pub target_ref: TargetRef,

    /// Where the restored volumes are mounted in the target
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    /// Number of replicas to restore (volume snapshot restores)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Claims to provision from snapshots (volume snapshot restores)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
}

/// Reference to the object being restored
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    /// API version of the target
    #[serde(default)]
    pub api_version: String,
    /// Kind of the target
    pub kind: String,
    /// Name of the target
    pub name: String,
}

/// Restore rule for a set of hosts
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRule {
    /// Host whose backed up data is restored (defaults to the target host)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_host: Option<String>,

    /// Hosts this rule applies to. Empty matches every host.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_hosts: Vec<String>,

    /// Paths to restore
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,

    /// Snapshots to restore from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<String>,
}

/// Task reference with explicit parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    /// Task name
    #[serde(default)]
    pub name: String,

    /// Explicit parameters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
}

/// Name/value parameter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Param {
    /// Parameter name
    pub name: String,
    /// Parameter value
    pub value: String,
}

/// Runtime settings for the pod and its containers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    /// Pod level settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodRuntimeSettings>,

    /// Settings applied to every container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerRuntimeSettings>,
}

/// Pod level runtime settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodRuntimeSettings {
    /// Node selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Service account used by the pod. When empty one is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Image pull secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,

    /// Affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Tolerations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    /// Priority class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Pod security context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,
}

/// Container level runtime settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRuntimeSettings {
    /// Compute resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Extra environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,

    /// Container security context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,

    /// Image pull policy override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

/// Scratch directory settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmptyDirSettings {
    /// Storage medium ("" or "Memory")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,

    /// Size limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_limit: Option<Quantity>,

    /// Disable the repository cache
    #[serde(default)]
    pub disable_caching: bool,
}

/// Phase of a restore session
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RestoreSessionPhase {
    /// Waiting to be launched
    Pending,
    /// Restore in progress
    Running,
    /// Every host restored successfully
    Succeeded,
    /// At least one host failed
    Failed,
    /// At least one host reported an unknown outcome
    Unknown,
}

impl RestoreSessionPhase {
    /// Succeeded and Failed are never left once reached
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Phase name as written to status
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }
}

const PHASE_NAMES: &[&str] = &["Pending", "Running", "Succeeded", "Failed", "Unknown"];

impl RestoreSessionPhase {
    /// Phase with the given status name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Pending" => Some(Self::Pending),
            "Running" => Some(Self::Running),
            "Succeeded" => Some(Self::Succeeded),
            "Failed" => Some(Self::Failed),
            "Unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Read a stored phase, treating `""` like an absent phase
fn empty_phase_as_none<'de, D>(deserializer: D) -> Result<Option<RestoreSessionPhase>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(name) => RestoreSessionPhase::from_name(name)
            .map(Some)
            .ok_or_else(|| de::Error::unknown_variant(name, PHASE_NAMES)),
    }
}

fn phase_schema(_: &mut SchemaGenerator) -> Schema {
    SchemaObject {
        instance_type: Some(InstanceType::String.into()),
        enum_values: Some(
            std::iter::once("")
                .chain(PHASE_NAMES.iter().copied())
                .map(Into::into)
                .collect(),
        ),
        ..Default::default()
    }
    .into()
}

impl std::fmt::Display for RestoreSessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the restore on a single host
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum HostRestorePhase {
    /// Restore running on the host
    Running,
    /// Host restored
    Succeeded,
    /// Host failed
    Failed,
    /// Host outcome unknown
    Unknown,
}

/// Per-host restore outcome
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostRestoreStats {
    /// Host identifier
    pub hostname: String,

    /// Host phase
    pub phase: HostRestorePhase,

    /// Time taken on this host (e.g. "1m30s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// Error detail, set when the phase is Failed or Unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// RestoreSession status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSessionStatus {
    /// Current phase. Absent or empty means the session has not been seen yet.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_phase_as_none"
    )]
    #[schemars(schema_with = "phase_schema")]
    pub phase: Option<RestoreSessionPhase>,

    /// Number of hosts expected to report an outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_hosts: Option<i32>,

    /// Host outcomes in arrival order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats: Vec<HostRestoreStats>,

    /// Sum of every host duration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_duration: Option<String>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl RestoreSession {
    /// Labels stamped on every object created for this session
    pub fn offshoot_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
        labels.insert(
            RESTORE_SESSION_LABEL.to_string(),
            self.metadata.name.clone().unwrap_or_default(),
        );
        labels
    }

    /// Namespace the referenced Repository lives in
    pub fn repository_namespace(&self) -> String {
        self.spec
            .repository
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| self.metadata.namespace.clone().unwrap_or_default())
    }

    /// Current phase, if any
    pub fn phase(&self) -> Option<RestoreSessionPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Explicit task parameters keyed by name. Later duplicates win.
    pub fn explicit_inputs(&self) -> BTreeMap<String, String> {
        self.spec
            .task
            .params
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect()
    }
}
