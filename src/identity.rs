//! # Identity Fingerprint
//!
//! The stable key under which Yale tracks one cloud principal. Every
//! consumer resource resolves to exactly one fingerprint; resources sharing
//! a fingerprint share one cache Entry and one provider-side credential.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Credential provider backing an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gcp,
    Azure,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Gcp => write!(f, "gcp"),
            Provider::Azure => write!(f, "azure"),
        }
    }
}

/// `(provider, scope, name)` fingerprint of one cloud principal.
///
/// - GCP: scope is the project ID, name is the service account email
/// - Azure: scope is the tenant ID, name is the application (client) ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub provider: Provider,
    pub scope: String,
    pub name: String,
}

impl Identity {
    #[must_use]
    pub fn gcp(project: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            provider: Provider::Gcp,
            scope: project.into(),
            name: email.into(),
        }
    }

    #[must_use]
    pub fn azure(tenant_id: impl Into<String>, application_id: impl Into<String>) -> Self {
        Self {
            provider: Provider::Azure,
            scope: tenant_id.into(),
            name: application_id.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.scope, self.name)
    }
}
