//! `GcpSaKey` custom resource.
//!
//! Declares that a Google service account should have an active key under
//! Yale management.

use super::{KeyRotation, Replication, SecretSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// GcpSaKey Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: yale.terra.bio/v1beta1
/// kind: GcpSaKey
/// metadata:
///   name: my-service-sa-key
///   namespace: terra-dev
/// spec:
///   googleServiceAccount:
///     name: my-service@my-project.iam.gserviceaccount.com
///     project: my-project
///   keyRotation:
///     rotateAfter: 30
///     disableAfter: 14
///     deleteAfter: 3
///   secret:
///     name: my-service-sa-secret
///     jsonKeyName: key.json
///     pemKeyName: key.pem
///   replications:
///     - type: vault
///       path: secret/dsde/my-service/sa-key
///       key: key.json
///       format: json
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "GcpSaKey",
    group = "yale.terra.bio",
    version = "v1beta1",
    namespaced,
    plural = "gcpsakeys"
)]
#[serde(rename_all = "camelCase")]
pub struct GcpSaKeySpec {
    /// The Google service account whose keys Yale manages
    pub google_service_account: GoogleServiceAccount,
    /// Rotation policy for this resource
    pub key_rotation: KeyRotation,
    /// Cluster-Secret target for the active key (optional)
    #[serde(default)]
    pub secret: Option<SecretSpec>,
    /// External sinks the active key is mirrored into (optional)
    #[serde(default)]
    pub replications: Vec<Replication>,
}

/// Reference to a Google service account.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GoogleServiceAccount {
    /// Service account email, e.g. `my-sa@my-project.iam.gserviceaccount.com`
    pub name: String,
    /// GCP project the service account lives in
    pub project: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_roundtrip_with_optional_fields_absent() {
        let yaml = r"
googleServiceAccount:
  name: sa@p.iam.gserviceaccount.com
  project: p
keyRotation:
  rotateAfter: 30
  disableAfter: 14
  deleteAfter: 3
";
        let spec: GcpSaKeySpec = serde_yaml::from_str(yaml).unwrap();
        assert!(spec.secret.is_none());
        assert!(spec.replications.is_empty());
        assert_eq!(spec.google_service_account.project, "p");
    }
}
