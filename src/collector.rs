//! # Resource Collector
//!
//! Reads every `GcpSaKey` and `AzureClientSecret` in the cluster,
//! normalizes them into [`ConsumerResource`] and groups them by identity
//! fingerprint. Resources sharing a fingerprint share one cache Entry and
//! one provider-side credential; the reconciler processes one group at a
//! time.

use crate::crd::{AzureClientSecret, Format, GcpSaKey, KeyRotation, Replication, SecretSpec};
use crate::error::{Error, Result};
use crate::identity::{Identity, Provider};
use kube::api::{Api, ListParams};
use kube::{Client, Resource as _};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

/// A consumer resource normalized across both CRD kinds.
#[derive(Debug, Clone)]
pub struct ConsumerResource {
    pub kind: String,
    pub api_version: String,
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub identity: Identity,
    pub key_rotation: KeyRotation,
    pub secret: Option<SecretSpec>,
    pub replications: Vec<Replication>,
}

impl ConsumerResource {
    /// `namespace/name`, the key under which sync status is recorded.
    #[must_use]
    pub fn resource_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Check the parts of the resource spec that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found; a bad
    /// spec is fatal for its identity, not for the pass.
    pub fn validate(&self) -> Result<()> {
        let at = format!("{} {}", self.kind, self.resource_key());

        if self.secret.is_none() && self.replications.is_empty() {
            return Err(Error::Config(format!(
                "{at}: declares no consumer location (neither secret nor replications)"
            )));
        }
        if let Some(secret) = &self.secret {
            if secret.name.is_empty() {
                return Err(Error::Config(format!("{at}: secret.name is empty")));
            }
            let no_json = secret.json_key_name.as_deref().is_none_or(str::is_empty);
            let no_pem = secret.pem_key_name.as_deref().is_none_or(str::is_empty);
            if no_json && no_pem {
                return Err(Error::Config(format!(
                    "{at}: secret declares neither jsonKeyName nor pemKeyName"
                )));
            }
            if self.identity.provider == Provider::Azure && !no_pem {
                return Err(Error::Config(format!(
                    "{at}: pemKeyName is not supported for Azure client secrets"
                )));
            }
        }
        for replication in &self.replications {
            if self.identity.provider == Provider::Azure
                && matches!(replication.format(), Format::Pem | Format::Map)
            {
                return Err(Error::Config(format!(
                    "{at}: format {:?} is not supported for Azure client secrets",
                    replication.format()
                )));
            }
            if let Replication::GithubActions { repo, .. }
            | Replication::GithubDependabot { repo, .. } = replication
            {
                if repo.split('/').filter(|s| !s.is_empty()).count() != 2 {
                    return Err(Error::Config(format!(
                        "{at}: GitHub repo '{repo}' must be in owner/repo form"
                    )));
                }
            }
        }
        Ok(())
    }

    fn from_gcp(resource: &GcpSaKey) -> Option<Self> {
        let namespace = resource.meta().namespace.clone()?;
        let name = resource.meta().name.clone()?;
        Some(Self {
            kind: "GcpSaKey".to_string(),
            api_version: "yale.terra.bio/v1beta1".to_string(),
            namespace,
            name,
            uid: resource.meta().uid.clone(),
            annotations: resource.meta().annotations.clone().unwrap_or_default(),
            identity: Identity::gcp(
                resource.spec.google_service_account.project.clone(),
                resource.spec.google_service_account.name.clone(),
            ),
            key_rotation: resource.spec.key_rotation.clone(),
            secret: resource.spec.secret.clone(),
            replications: resource.spec.replications.clone(),
        })
    }

    fn from_azure(resource: &AzureClientSecret) -> Option<Self> {
        let namespace = resource.meta().namespace.clone()?;
        let name = resource.meta().name.clone()?;
        Some(Self {
            kind: "AzureClientSecret".to_string(),
            api_version: "yale.terra.bio/v1beta1".to_string(),
            namespace,
            name,
            uid: resource.meta().uid.clone(),
            annotations: resource.meta().annotations.clone().unwrap_or_default(),
            identity: Identity::azure(
                resource.spec.azure_service_principal.tenant_id.clone(),
                resource.spec.azure_service_principal.application_id.clone(),
            ),
            key_rotation: resource.spec.key_rotation.clone(),
            secret: resource.spec.secret.clone(),
            replications: resource.spec.replications.clone(),
        })
    }
}

/// Group already-normalized resources by fingerprint.
#[must_use]
pub fn group_by_identity(
    resources: Vec<ConsumerResource>,
) -> HashMap<Identity, Vec<ConsumerResource>> {
    let mut groups: HashMap<Identity, Vec<ConsumerResource>> = HashMap::new();
    for resource in resources {
        groups
            .entry(resource.identity.clone())
            .or_default()
            .push(resource);
    }
    groups
}

/// List both CRD kinds across all namespaces and group them.
///
/// # Errors
///
/// Surfaces Kubernetes list failures through the error taxonomy.
pub async fn collect(client: &Client) -> Result<HashMap<Identity, Vec<ConsumerResource>>> {
    let gcp_api: Api<GcpSaKey> = Api::all(client.clone());
    let azure_api: Api<AzureClientSecret> = Api::all(client.clone());
    let params = ListParams::default();

    let gcp_list = gcp_api
        .list(&params)
        .await
        .map_err(|e| Error::from_kube(&e, "listing GcpSaKey resources"))?;
    let azure_list = azure_api
        .list(&params)
        .await
        .map_err(|e| Error::from_kube(&e, "listing AzureClientSecret resources"))?;

    let resources: Vec<ConsumerResource> = gcp_list
        .items
        .iter()
        .filter_map(ConsumerResource::from_gcp)
        .chain(azure_list.items.iter().filter_map(ConsumerResource::from_azure))
        .collect();

    let groups = group_by_identity(resources);
    info!(
        "collected {} consumer resources across {} identities",
        groups.values().map(Vec::len).sum::<usize>(),
        groups.len()
    );
    Ok(groups)
}
