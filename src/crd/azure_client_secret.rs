//! `AzureClientSecret` custom resource.
//!
//! Declares that an Azure application should have an active client secret
//! under Yale management. Azure application passwords cannot be disabled at
//! the provider, so the disable step is purely a cache-side transition; see
//! the reconciler for how deletion is gated instead.

use super::{KeyRotation, Replication, SecretSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// AzureClientSecret Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: yale.terra.bio/v1beta1
/// kind: AzureClientSecret
/// metadata:
///   name: my-app-client-secret
///   namespace: terra-dev
/// spec:
///   azureServicePrincipal:
///     applicationId: 11111111-2222-3333-4444-555555555555
///     tenantId: 99999999-8888-7777-6666-555555555555
///   keyRotation:
///     rotateAfter: 90
///     disableAfter: 14
///     deleteAfter: 3
///     ignoreUsageMetrics: true
///   secret:
///     name: my-app-secret
///     jsonKeyName: client-secret
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "AzureClientSecret",
    group = "yale.terra.bio",
    version = "v1beta1",
    namespaced,
    plural = "azureclientsecrets"
)]
#[serde(rename_all = "camelCase")]
pub struct AzureClientSecretSpec {
    /// The Azure application whose password credentials Yale manages
    pub azure_service_principal: AzureServicePrincipal,
    /// Rotation policy for this resource
    pub key_rotation: KeyRotation,
    /// Cluster-Secret target for the active secret (optional)
    #[serde(default)]
    pub secret: Option<SecretSpec>,
    /// External sinks the active secret is mirrored into (optional)
    #[serde(default)]
    pub replications: Vec<Replication>,
}

/// Reference to an Azure application (service principal).
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureServicePrincipal {
    /// Application (client) ID
    pub application_id: String,
    /// Tenant the application belongs to
    pub tenant_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_parses_with_replications() {
        let yaml = r"
azureServicePrincipal:
  applicationId: app-id
  tenantId: tenant-id
keyRotation:
  rotateAfter: 90
  disableAfter: 14
  deleteAfter: 3
  ignoreUsageMetrics: true
replications:
  - type: githubActions
    repo: broadinstitute/terra
    secret: AZURE_CLIENT_SECRET
    format: plaintext
";
        let spec: AzureClientSecretSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(spec.key_rotation.ignore_usage_metrics);
        assert_eq!(spec.replications.len(), 1);
    }
}
