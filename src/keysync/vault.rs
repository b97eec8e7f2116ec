//! Vault sink.
//!
//! Writes the configured key into the KV map at a path, preserving any
//! other keys already stored there, then reads back to verify. Paths are
//! `mount/rest/of/path` against the KV v2 engine.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use vaultrs::client::{VaultClient, VaultClientSettingsBuilder};
use vaultrs::error::ClientError;
use vaultrs::kv2;

/// Write seam over the Vault sink.
#[async_trait]
pub trait VaultStore: Send + Sync {
    /// Merge `{key: payload}` into the map at `path`, preserving other
    /// keys, and verify the write.
    async fn merge_write(&self, path: &str, key: &str, payload: &[u8]) -> Result<()>;
}

enum Backend {
    Client(Box<VaultClient>),
    /// Construction failed; every use reports why.
    Unconfigured(String),
}

/// KV v2 implementation of [`VaultStore`].
pub struct VaultKv {
    backend: Backend,
}

impl std::fmt::Debug for VaultKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKv").finish_non_exhaustive()
    }
}

impl VaultKv {
    /// Build a client from `VAULT_ADDR` and `VAULT_TOKEN`. When either is
    /// missing the sink stays unconfigured and errors only if a resource
    /// actually declares a Vault replication.
    #[must_use]
    pub fn from_env() -> Self {
        let addr = std::env::var("VAULT_ADDR");
        let token = std::env::var("VAULT_TOKEN");
        match (addr, token) {
            (Ok(addr), Ok(token)) => {
                let settings = VaultClientSettingsBuilder::default()
                    .address(addr)
                    .token(token)
                    .build();
                match settings.map(VaultClient::new) {
                    Ok(Ok(client)) => Self {
                        backend: Backend::Client(Box::new(client)),
                    },
                    Ok(Err(e)) => Self {
                        backend: Backend::Unconfigured(format!("vault client: {e}")),
                    },
                    Err(e) => Self {
                        backend: Backend::Unconfigured(format!("vault settings: {e}")),
                    },
                }
            }
            _ => Self {
                backend: Backend::Unconfigured(
                    "VAULT_ADDR and VAULT_TOKEN are not both set".to_string(),
                ),
            },
        }
    }

    fn client(&self) -> Result<&VaultClient> {
        match &self.backend {
            Backend::Client(client) => Ok(client),
            Backend::Unconfigured(reason) => Err(Error::Config(format!(
                "vault replication declared but vault is unconfigured: {reason}"
            ))),
        }
    }
}

/// Split `mount/rest` into the KV mount and the secret path under it.
fn split_mount(path: &str) -> Result<(&str, &str)> {
    path.split_once('/')
        .filter(|(mount, rest)| !mount.is_empty() && !rest.is_empty())
        .ok_or_else(|| {
            Error::Config(format!("vault path '{path}' must be in mount/path form"))
        })
}

fn classify(err: &ClientError, context: &str) -> Error {
    match err {
        ClientError::APIError { code: 404, .. } => Error::NotFound(context.to_string()),
        ClientError::APIError { code: 403, .. } => {
            Error::PermissionDenied(format!("{context}: {err}"))
        }
        other => Error::ProviderUnavailable(format!("{context}: {other}")),
    }
}

#[async_trait]
impl VaultStore for VaultKv {
    async fn merge_write(&self, path: &str, key: &str, payload: &[u8]) -> Result<()> {
        let client = self.client()?;
        let (mount, secret_path) = split_mount(path)?;
        let value = String::from_utf8(payload.to_vec())
            .map_err(|e| Error::Config(format!("vault payload is not UTF-8: {e}")))?;

        let mut map: HashMap<String, String> =
            match kv2::read(client, mount, secret_path).await {
                Ok(map) => map,
                Err(e) => {
                    let classified = classify(&e, &format!("reading vault path {path}"));
                    if classified.is_not_found() {
                        HashMap::new()
                    } else {
                        return Err(classified);
                    }
                }
            };
        map.insert(key.to_string(), value.clone());

        kv2::set(client, mount, secret_path, &map)
            .await
            .map_err(|e| classify(&e, &format!("writing vault path {path}")))?;

        let read_back: HashMap<String, String> = kv2::read(client, mount, secret_path)
            .await
            .map_err(|e| classify(&e, &format!("verifying vault path {path}")))?;
        if read_back.get(key) != Some(&value) {
            return Err(Error::SyncConflict(format!(
                "vault path {path} key {key} does not hold the written value"
            )));
        }
        Ok(())
    }
}
