//! Authorization Provisioner
//!
//! Ensures the identity, role and binding each restore job variant needs.
//! Cluster roles are shared by every session of a variant: they carry no
//! per-session labels or owners and are only ever patched to their canonical
//! rule set. Bindings and identities are owned by the session that needs them.

mod repo_reader;

pub use repo_reader::*;

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{
    api::{DeleteParams, ListParams},
    Api, Client,
};
use tracing::{debug, info};

use crate::crd::{MANAGED_BY, MANAGED_BY_LABEL};
use crate::error::Result;
use crate::resources::{create_or_patch, ensure_owner_reference, upsert_labels};

/// Cluster role bound to standard restore jobs
pub const RESTORE_JOB_CLUSTER_ROLE: &str = "backup-oso-restore-job";

/// Cluster role bound to volume snapshot restore jobs
pub const VOLUME_SNAPSHOT_RESTORE_CLUSTER_ROLE: &str = "backup-oso-volumesnapshot-restore-job";

/// Cluster role granting read access to storage classes
pub const STORAGE_CLASS_CLUSTER_ROLE: &str = "backup-oso-storageclass";

/// Label carrying the namespace of the session a cluster scoped binding belongs to
pub const RESTORE_SESSION_NAMESPACE_LABEL: &str = "backup.oso.sh/restore-session-namespace";

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";
const KIND_CLUSTER_ROLE: &str = "ClusterRole";
const KIND_ROLE: &str = "Role";
const KIND_SERVICE_ACCOUNT: &str = "ServiceAccount";

/// Job variants with their own authorization set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobVariant {
    /// Job resolved from a Task
    Restore,
    /// Job restoring volumes from snapshots
    VolumeSnapshotRestore,
}

impl JobVariant {
    /// Shared cluster role of the variant
    pub fn cluster_role_name(self) -> &'static str {
        match self {
            JobVariant::Restore => RESTORE_JOB_CLUSTER_ROLE,
            JobVariant::VolumeSnapshotRestore => VOLUME_SNAPSHOT_RESTORE_CLUSTER_ROLE,
        }
    }

    /// Name of the binding created for `owner_name`
    pub fn binding_name(self, owner_name: &str) -> String {
        format!("{}-{}", owner_name, self.cluster_role_name())
    }

    /// Canonical rules of the variant.
    ///
    /// `psps` is only honoured by the restore variant; an empty list grants no
    /// pod security policy at all.
    pub fn rules(self, psps: &[String]) -> Vec<PolicyRule> {
        match self {
            JobVariant::Restore => restore_job_rules(psps),
            JobVariant::VolumeSnapshotRestore => volume_snapshot_restore_rules(),
        }
    }
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn restore_job_rules(psps: &[String]) -> Vec<PolicyRule> {
    let mut rules = vec![
        rule(
            &["backup.oso.sh"],
            &["restoresessions", "restoresessions/status"],
            &["*"],
        ),
        rule(&["backup.oso.sh"], &["repositories"], &["get"]),
        rule(&[""], &["secrets"], &["get"]),
        rule(&[""], &["events"], &["create"]),
    ];
    if !psps.is_empty() {
        let mut use_psp = rule(&["policy"], &["podsecuritypolicies"], &["use"]);
        use_psp.resource_names = Some(psps.to_vec());
        rules.push(use_psp);
    }
    rules
}

fn volume_snapshot_restore_rules() -> Vec<PolicyRule> {
    vec![
        rule(&["backup.oso.sh"], &["*"], &["*"]),
        rule(&[""], &["events"], &["create"]),
        rule(
            &[""],
            &["persistentvolumeclaims"],
            &["get", "list", "watch", "create", "patch"],
        ),
        rule(
            &["snapshot.storage.k8s.io"],
            &["volumesnapshots"],
            &["get", "list"],
        ),
        rule(&["storage.k8s.io"], &["storageclasses"], &["get"]),
    ]
}

fn storage_class_rules() -> Vec<PolicyRule> {
    vec![rule(&["storage.k8s.io"], &["storageclasses"], &["get"])]
}

fn shared_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string())])
}

/// Set the canonical rule set on a shared cluster role
pub fn with_rules(mut role: ClusterRole, rules: Vec<PolicyRule>) -> ClusterRole {
    upsert_labels(&mut role.metadata, &shared_labels());
    role.rules = Some(rules);
    role
}

/// Role reference to a cluster role
pub fn cluster_role_ref(name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_GROUP.to_string(),
        kind: KIND_CLUSTER_ROLE.to_string(),
        name: name.to_string(),
    }
}

/// Role reference to a namespaced role
pub fn role_ref(name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_GROUP.to_string(),
        kind: KIND_ROLE.to_string(),
        name: name.to_string(),
    }
}

/// Subject for a service account
pub fn service_account_subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: KIND_SERVICE_ACCOUNT.to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Point a role binding at `role` with `subject` as its only subject
pub fn bind(
    mut binding: RoleBinding,
    owner: Option<&OwnerReference>,
    labels: &BTreeMap<String, String>,
    role: RoleRef,
    subject: Subject,
) -> RoleBinding {
    if let Some(owner) = owner {
        ensure_owner_reference(&mut binding.metadata, owner);
    }
    upsert_labels(&mut binding.metadata, labels);
    binding.role_ref = role;
    binding.subjects = Some(vec![subject]);
    binding
}

/// Ensure a shared cluster role holds exactly `rules`
pub async fn ensure_cluster_role(client: &Client, name: &str, rules: Vec<PolicyRule>) -> Result<()> {
    let api: Api<ClusterRole> = Api::all(client.clone());
    let meta = ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(shared_labels()),
        ..Default::default()
    };
    let (_, outcome) = create_or_patch(&api, meta, |role| with_rules(role, rules.clone())).await?;
    debug!(role = name, ?outcome, "Ensured cluster role");
    Ok(())
}

/// Identity of the job that needs authorization
#[derive(Clone, Debug)]
pub struct JobIdentity<'a> {
    /// Session owning the objects
    pub owner: &'a OwnerReference,
    /// Namespace of the session and its job
    pub namespace: &'a str,
    /// Service account the job runs as
    pub service_account: &'a str,
    /// Labels for created objects
    pub labels: &'a BTreeMap<String, String>,
}

async fn ensure_variant_binding(client: &Client, variant: JobVariant, job: &JobIdentity<'_>) -> Result<()> {
    let api: Api<RoleBinding> = Api::namespaced(client.clone(), job.namespace);
    let meta = ObjectMeta {
        name: Some(variant.binding_name(&job.owner.name)),
        namespace: Some(job.namespace.to_string()),
        labels: Some(job.labels.clone()),
        ..Default::default()
    };
    let (_, outcome) = create_or_patch(&api, meta, |rb| {
        bind(
            rb,
            Some(job.owner),
            job.labels,
            cluster_role_ref(variant.cluster_role_name()),
            service_account_subject(job.service_account, job.namespace),
        )
    })
    .await?;
    debug!(variant = ?variant, ?outcome, "Ensured role binding");
    Ok(())
}

/// Ensure the cluster role and binding of a standard restore job
pub async fn ensure_restore_job_rbac(client: &Client, job: &JobIdentity<'_>, psps: &[String]) -> Result<()> {
    let variant = JobVariant::Restore;
    ensure_cluster_role(client, variant.cluster_role_name(), variant.rules(psps)).await?;
    ensure_variant_binding(client, variant, job).await
}

/// Ensure the roles and bindings of a volume snapshot restore job.
///
/// Besides the variant's own role this grants storage class access through a
/// cluster role binding. Cluster scoped objects cannot be owned by a
/// namespaced session, so that binding is labelled instead and removed by
/// [`delete_storage_class_bindings`] when the session goes away.
pub async fn ensure_volume_snapshot_restore_job_rbac(client: &Client, job: &JobIdentity<'_>) -> Result<()> {
    let variant = JobVariant::VolumeSnapshotRestore;
    ensure_cluster_role(client, variant.cluster_role_name(), variant.rules(&[])).await?;
    ensure_variant_binding(client, variant, job).await?;

    ensure_cluster_role(client, STORAGE_CLASS_CLUSTER_ROLE, storage_class_rules()).await?;

    let mut labels = job.labels.clone();
    labels.insert(
        RESTORE_SESSION_NAMESPACE_LABEL.to_string(),
        job.namespace.to_string(),
    );
    let api: Api<ClusterRoleBinding> = Api::all(client.clone());
    let meta = ObjectMeta {
        name: Some(storage_class_binding_name(&job.owner.name, job.namespace)),
        labels: Some(labels.clone()),
        ..Default::default()
    };
    let (_, outcome) = create_or_patch(&api, meta, |mut crb| {
        upsert_labels(&mut crb.metadata, &labels);
        crb.role_ref = cluster_role_ref(STORAGE_CLASS_CLUSTER_ROLE);
        crb.subjects = Some(vec![service_account_subject(job.service_account, job.namespace)]);
        crb
    })
    .await?;
    debug!(?outcome, "Ensured storage class cluster role binding");
    Ok(())
}

/// Name of the storage class cluster role binding of a session
pub fn storage_class_binding_name(owner_name: &str, namespace: &str) -> String {
    format!("{}-{}-{}", namespace, owner_name, STORAGE_CLASS_CLUSTER_ROLE)
}

/// Delete the storage class cluster role bindings created for a session
pub async fn delete_storage_class_bindings(client: &Client, session: &str, namespace: &str) -> Result<()> {
    let api: Api<ClusterRoleBinding> = Api::all(client.clone());
    let selector = format!(
        "{}={},{}={}",
        crate::crd::RESTORE_SESSION_LABEL,
        session,
        RESTORE_SESSION_NAMESPACE_LABEL,
        namespace
    );
    let bindings = api.list(&ListParams::default().labels(&selector)).await?;
    for binding in bindings {
        let Some(name) = binding.metadata.name else {
            continue;
        };
        match api.delete(&name, &DeleteParams::background()).await {
            Ok(_) => info!(binding = %name, "Deleted storage class cluster role binding"),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
