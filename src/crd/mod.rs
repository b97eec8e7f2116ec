//! # Custom Resource Definitions
//!
//! The two consumer resources operators declare to put an identity under
//! Yale management:
//!
//! - [`GcpSaKey`](gcp_sa_key::GcpSaKey) — a Google service account key
//! - [`AzureClientSecret`](azure_client_secret::AzureClientSecret) — an
//!   Azure application client secret
//!
//! Both carry the same lifecycle sub-specs defined here: a rotation policy,
//! an optional cluster-Secret target and an optional list of replication
//! sinks.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod azure_client_secret;
pub mod gcp_sa_key;

pub use azure_client_secret::{AzureClientSecret, AzureServicePrincipal};
pub use gcp_sa_key::{GcpSaKey, GoogleServiceAccount};

/// Day-count thresholds governing the credential lifecycle.
///
/// Multiple resources may target the same identity with different policies;
/// the effective thresholds are aggregated by
/// [`Cutoffs`](crate::cutoffs::Cutoffs).
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyRotation {
    /// Days after issuance before the active key is rotated
    pub rotate_after: u32,
    /// Days after rotation before the superseded key is disabled
    pub disable_after: u32,
    /// Days after disablement before the key is deleted at the provider
    pub delete_after: u32,
    /// Skip the last-authentication check before disabling.
    /// Use for identities whose provider publishes no usage telemetry.
    #[serde(default)]
    pub ignore_usage_metrics: bool,
}

/// Cluster-Secret target for the active credential.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretSpec {
    /// Name of the Secret Yale creates in the resource's namespace
    pub name: String,
    /// Data field holding the raw credential material (JSON for GCP,
    /// the client-secret string for Azure)
    #[serde(default)]
    pub json_key_name: Option<String>,
    /// Data field holding the PEM-extracted private key (GCP only)
    #[serde(default)]
    pub pem_key_name: Option<String>,
}

/// Encoding of the credential material written to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Provider-specific key/value decomposition of the JSON payload
    Map,
    /// The raw material exactly as received
    Json,
    /// Base64 of the raw material
    Base64,
    /// PEM private key extracted from the JSON payload (GCP only)
    Pem,
    /// The raw material as UTF-8
    Plaintext,
}

impl Default for Format {
    fn default() -> Self {
        Format::Plaintext
    }
}

/// A replication sink for the active credential.
///
/// Tagged by `type` so operators declare heterogeneous sink lists in one
/// field.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Replication {
    /// HashiCorp Vault KV path. The configured key is merged into the map
    /// at `path`; other keys at that path are preserved.
    Vault {
        path: String,
        key: String,
        #[serde(default)]
        format: Format,
    },
    /// Google Secret Manager secret. A new version is added per sync.
    GoogleSecretManager {
        project: String,
        secret: String,
        #[serde(default)]
        format: Format,
    },
    /// GitHub Actions repository secret, sealed with the repo public key.
    GithubActions {
        /// `owner/repo`
        repo: String,
        secret: String,
        #[serde(default)]
        format: Format,
    },
    /// GitHub Dependabot repository secret, sealed with the repo public key.
    GithubDependabot {
        /// `owner/repo`
        repo: String,
        secret: String,
        #[serde(default)]
        format: Format,
    },
}

impl Replication {
    /// Declared encoding for this sink.
    #[must_use]
    pub fn format(&self) -> Format {
        match self {
            Replication::Vault { format, .. }
            | Replication::GoogleSecretManager { format, .. }
            | Replication::GithubActions { format, .. }
            | Replication::GithubDependabot { format, .. } => *format,
        }
    }

    /// Short descriptor used in logs and in the keysync checksum.
    #[must_use]
    pub fn descriptor(&self) -> String {
        match self {
            Replication::Vault { path, key, format } => {
                format!("vault:{path}:{key}:{format:?}")
            }
            Replication::GoogleSecretManager {
                project,
                secret,
                format,
            } => format!("gsm:{project}:{secret}:{format:?}"),
            Replication::GithubActions {
                repo,
                secret,
                format,
            } => format!("gha:{repo}:{secret}:{format:?}"),
            Replication::GithubDependabot {
                repo,
                secret,
                format,
            } => format!("ghd:{repo}:{secret}:{format:?}"),
        }
    }
}
