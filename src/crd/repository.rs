//! Repository Custom Resource Definition

use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, NFSVolumeSource, PersistentVolumeClaimVolumeSource, Volume,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Repository resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "backup.oso.sh",
    version = "v1alpha1",
    kind = "Repository",
    plural = "repositories",
    singular = "repository",
    shortname = "repo",
    namespaced,
    printcolumn = r#"{"name": "Secret", "type": "string", "jsonPath": ".spec.backend.storageSecretName"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    /// Storage backend
    pub backend: Backend,
}

/// Storage backend. Exactly one provider is expected to be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    /// Secret holding the backend credentials
    #[serde(default)]
    pub storage_secret_name: String,

    /// S3 compatible backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Backend>,

    /// Google Cloud Storage backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsBackend>,

    /// Azure Blob backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureBackend>,

    /// OpenStack Swift backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swift: Option<SwiftBackend>,

    /// Backblaze B2 backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b2: Option<B2Backend>,

    /// REST server backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest: Option<RestBackend>,

    /// Locally mounted volume backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalBackend>,
}

/// S3 backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Backend {
    /// Endpoint (e.g. s3.amazonaws.com or a MinIO URL)
    #[serde(default)]
    pub endpoint: String,
    /// Bucket
    pub bucket: String,
    /// Prefix within the bucket
    #[serde(default)]
    pub prefix: String,
    /// Region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// GCS backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcsBackend {
    /// Bucket
    pub bucket: String,
    /// Prefix within the bucket
    #[serde(default)]
    pub prefix: String,
    /// Maximum concurrent connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<i64>,
}

/// Azure backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureBackend {
    /// Container
    pub container: String,
    /// Prefix within the container
    #[serde(default)]
    pub prefix: String,
    /// Maximum concurrent connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<i64>,
}

/// Swift backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SwiftBackend {
    /// Container
    pub container: String,
    /// Prefix within the container
    #[serde(default)]
    pub prefix: String,
}

/// B2 backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct B2Backend {
    /// Bucket
    pub bucket: String,
    /// Prefix within the bucket
    #[serde(default)]
    pub prefix: String,
    /// Maximum concurrent connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<i64>,
}

/// REST server backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestBackend {
    /// Server URL
    pub url: String,
}

/// Local volume backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalBackend {
    /// Claim backing the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimVolumeSource>,

    /// Host directory backing the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolumeSource>,

    /// NFS export backing the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs: Option<NFSVolumeSource>,

    /// Where the volume is mounted in restore containers
    pub mount_path: String,

    /// Sub-path within the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

/// Name of the volume attached for a local backend
pub const LOCAL_BACKEND_VOLUME: &str = "local-backend";

impl LocalBackend {
    /// Pod volume carrying the backend
    pub fn to_volume(&self) -> Volume {
        Volume {
            name: LOCAL_BACKEND_VOLUME.to_string(),
            persistent_volume_claim: self.persistent_volume_claim.clone(),
            host_path: self.host_path.clone(),
            nfs: self.nfs.clone(),
            ..Default::default()
        }
    }
}

impl Backend {
    /// Provider name as understood by the restore tooling
    pub fn provider(&self) -> Option<&'static str> {
        if self.s3.is_some() {
            Some("s3")
        } else if self.gcs.is_some() {
            Some("gcs")
        } else if self.azure.is_some() {
            Some("azure")
        } else if self.swift.is_some() {
            Some("swift")
        } else if self.b2.is_some() {
            Some("b2")
        } else if self.rest.is_some() {
            Some("rest")
        } else if self.local.is_some() {
            Some("local")
        } else {
            None
        }
    }

    /// Bucket (or container) and prefix of the backend
    pub fn bucket_and_prefix(&self) -> (String, String) {
        if let Some(s3) = &self.s3 {
            (s3.bucket.clone(), s3.prefix.clone())
        } else if let Some(gcs) = &self.gcs {
            (gcs.bucket.clone(), gcs.prefix.clone())
        } else if let Some(azure) = &self.azure {
            (azure.container.clone(), azure.prefix.clone())
        } else if let Some(swift) = &self.swift {
            (swift.container.clone(), swift.prefix.clone())
        } else if let Some(b2) = &self.b2 {
            (b2.bucket.clone(), b2.prefix.clone())
        } else if let Some(local) = &self.local {
            (String::new(), local.mount_path.clone())
        } else {
            (String::new(), String::new())
        }
    }

    /// Endpoint, for providers that have one
    pub fn endpoint(&self) -> String {
        self.s3.as_ref().map(|s3| s3.endpoint.clone()).unwrap_or_default()
    }

    /// REST server URL, for the rest provider
    pub fn rest_url(&self) -> String {
        self.rest.as_ref().map(|r| r.url.clone()).unwrap_or_default()
    }

    /// Connection limit, for providers that support one
    pub fn max_connections(&self) -> Option<i64> {
        self.gcs
            .as_ref()
            .and_then(|g| g.max_connections)
            .or_else(|| self.azure.as_ref().and_then(|a| a.max_connections))
            .or_else(|| self.b2.as_ref().and_then(|b| b.max_connections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_backend_builds_named_volume() {
        let backend: Backend = serde_json::from_value(serde_json::json!({
            "local": {
                "mountPath": "/safe/data",
                "persistentVolumeClaim": {"claimName": "restore-pvc"}
            }
        }))
        .unwrap();
        let local = backend.local.as_ref().unwrap();
        assert_eq!(local.mount_path, "/safe/data");
        let volume = local.to_volume();
        assert_eq!(volume.name, LOCAL_BACKEND_VOLUME);
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "restore-pvc"
        );
        assert_eq!(backend.provider(), Some("local"));
        assert_eq!(backend.bucket_and_prefix(), (String::new(), "/safe/data".to_string()));
    }

    #[test]
    fn s3_facts() {
        let backend = Backend {
            storage_secret_name: "s3-secret".to_string(),
            s3: Some(S3Backend {
                endpoint: "s3.amazonaws.com".to_string(),
                bucket: "backups".to_string(),
                prefix: "pg".to_string(),
                region: None,
            }),
            ..Default::default()
        };
        assert_eq!(backend.provider(), Some("s3"));
        assert_eq!(backend.endpoint(), "s3.amazonaws.com");
        assert_eq!(backend.bucket_and_prefix(), ("backups".to_string(), "pg".to_string()));
        assert_eq!(backend.max_connections(), None);
    }
}
