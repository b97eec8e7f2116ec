//! # Cache
//!
//! Key-value store from identity fingerprint to [`Entry`], backed by
//! cluster Secrets in a dedicated namespace. One Secret per Entry, named
//! deterministically from the fingerprint. The cache is the sole authority
//! on which credentials exist for an identity.
//!
//! I/O failures surface verbatim through the error taxonomy; "not found" is
//! the typed [`Error::NotFound`](crate::error::Error::NotFound) so callers
//! can branch on it.

use crate::error::{Error, Result};
use crate::identity::Identity;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, info};

mod entry;
pub use entry::{CurrentKey, Entry, SyncStatus, CACHE_SCHEMA_VERSION};

/// Data field inside the cache Secret holding the serialized envelope.
const ENTRY_DATA_KEY: &str = "entry.json";
/// Label selecting Yale cache Secrets.
const MANAGED_BY_LABEL: (&str, &str) = ("app.kubernetes.io/managed-by", "yale");

/// Persistence contract the reconciler drives. The production
/// implementation is [`KubeCache`]; tests substitute an in-memory fake.
#[async_trait]
pub trait Cache: Send + Sync {
    /// All Entries in the cache namespace. Used at startup only.
    async fn list(&self) -> Result<Vec<Entry>>;

    /// The Entry for `identity`, or a fresh empty Entry if none is
    /// persisted yet. The backing Secret is created lazily on first `save`.
    async fn get_or_create(&self, identity: &Identity) -> Result<Entry>;

    /// Serialize and write the backing Secret (create-or-update). A failed
    /// save never corrupts the previously persisted state.
    async fn save(&self, entry: &Entry) -> Result<()>;

    /// Remove the backing Secret. Refused unless the Entry tracks no keys.
    async fn delete(&self, identity: &Identity) -> Result<()>;
}

/// Deterministic, collision-resistant cache Secret name for a fingerprint.
///
/// `yale-cache-{provider}-{digest16}-{hint}`, where the digest covers scope
/// and name and the hint is the sanitized identity name. Always a valid
/// DNS-1123 subdomain of at most 253 characters.
#[must_use]
pub fn cache_secret_name(identity: &Identity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.scope.as_bytes());
    hasher.update(b":");
    hasher.update(identity.name.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let mut name = format!(
        "yale-cache-{}-{}-{}",
        identity.provider,
        &digest[..16],
        sanitize_name_hint(&identity.name)
    );
    name.truncate(253);
    name.trim_end_matches('-').to_string()
}

/// Lowercase, keep `[a-z0-9-]`, collapse runs of dashes, trim edges.
fn sanitize_name_hint(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_dash = false;
    for c in name.to_lowercase().chars() {
        let mapped = if c.is_ascii_alphanumeric() { c } else { '-' };
        if mapped == '-' {
            if !prev_dash {
                out.push('-');
            }
            prev_dash = true;
        } else {
            out.push(mapped);
            prev_dash = false;
        }
    }
    out.trim_matches('-').to_string()
}

/// Cluster-Secret-backed cache.
#[derive(Clone)]
pub struct KubeCache {
    client: Client,
    namespace: String,
}

impl std::fmt::Debug for KubeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCache")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeCache {
    #[must_use]
    pub fn new(client: Client, namespace: String) -> Self {
        Self { client, namespace }
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn entry_from_secret(secret: &Secret) -> Result<Entry> {
        let name = secret.metadata.name.as_deref().unwrap_or("<unnamed>");
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(ENTRY_DATA_KEY))
            .ok_or_else(|| {
                Error::Config(format!("cache secret {name} has no {ENTRY_DATA_KEY} field"))
            })?;
        Entry::from_bytes(&data.0)
    }

    fn secret_for_entry(&self, entry: &Entry) -> Result<Secret> {
        let mut data = BTreeMap::new();
        data.insert(ENTRY_DATA_KEY.to_string(), ByteString(entry.to_bytes()?));

        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.0.to_string(), MANAGED_BY_LABEL.1.to_string());

        Ok(Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(cache_secret_name(&entry.identity)),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        })
    }
}

#[async_trait]
impl Cache for KubeCache {
    async fn list(&self) -> Result<Vec<Entry>> {
        let selector = format!("{}={}", MANAGED_BY_LABEL.0, MANAGED_BY_LABEL.1);
        let params = ListParams::default().labels(&selector);
        let secrets = self
            .secrets()
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(&e, "listing cache secrets"))?;

        let mut entries = Vec::with_capacity(secrets.items.len());
        for secret in &secrets.items {
            entries.push(Self::entry_from_secret(secret)?);
        }
        Ok(entries)
    }

    async fn get_or_create(&self, identity: &Identity) -> Result<Entry> {
        let name = cache_secret_name(identity);
        match self.secrets().get(&name).await {
            Ok(secret) => Self::entry_from_secret(&secret),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                debug!("no cache entry for {identity}; starting empty");
                Ok(Entry::new(identity.clone()))
            }
            Err(e) => Err(Error::from_kube(&e, "reading cache secret")),
        }
    }

    async fn save(&self, entry: &Entry) -> Result<()> {
        let secret = self.secret_for_entry(entry)?;
        let name = cache_secret_name(&entry.identity);
        self.secrets()
            .patch(
                &name,
                &PatchParams::apply("yale").force(),
                &Patch::Apply(&secret),
            )
            .await
            .map_err(|e| Error::from_kube(&e, "saving cache secret"))?;
        debug!("persisted cache entry for {}", entry.identity);
        Ok(())
    }

    async fn delete(&self, identity: &Identity) -> Result<()> {
        let current = self.get_or_create(identity).await?;
        if !current.is_empty() {
            return Err(Error::InvariantViolation(format!(
                "{identity}: refusing to delete cache entry that still tracks keys"
            )));
        }
        let name = cache_secret_name(identity);
        match self.secrets().delete(&name, &Default::default()).await {
            Ok(_) => {
                info!("deleted cache entry for {identity}");
                Ok(())
            }
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(Error::from_kube(&e, "deleting cache secret")),
        }
    }
}
