//! GCP adapter over the IAM service-account-keys REST surface.
//!
//! References:
//! - [IAM service account keys REST API](https://cloud.google.com/iam/docs/reference/rest/v1/projects.serviceAccounts.keys)

use super::{Key, KeyOps, ProviderKey};
use crate::error::{Error, Result};
use crate::identity::{Identity, Provider};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_BASE_URL: &str = "https://iam.googleapis.com";

/// IAM REST adapter for service-account keys.
pub struct GcpKeyOps {
    http: Client,
    base_url: String,
    access_token: String,
}

impl std::fmt::Debug for GcpKeyOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpKeyOps")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceAccountKeyResource {
    /// `projects/{p}/serviceAccounts/{email}/keys/{id}`
    name: String,
    #[serde(default)]
    private_key_data: Option<String>,
    #[serde(default)]
    valid_after_time: Option<DateTime<Utc>>,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Deserialize)]
struct ListKeysResponse {
    #[serde(default)]
    keys: Vec<ServiceAccountKeyResource>,
}

impl GcpKeyOps {
    /// Build an adapter with the production endpoint and the configured
    /// per-request deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn new(access_token: String, request_timeout: Duration) -> Result<Self> {
        Self::with_base_url(access_token, request_timeout, DEFAULT_BASE_URL.to_string())
    }

    /// Build an adapter against an alternate endpoint (tests, emulators).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn with_base_url(
        access_token: String,
        request_timeout: Duration,
        base_url: String,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("building IAM HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            access_token,
        })
    }

    fn key_path(&self, key: &Key) -> String {
        format!(
            "{}/v1/projects/{}/serviceAccounts/{}/keys/{}",
            self.base_url, key.identity.scope, key.identity.name, key.id
        )
    }

    fn keys_path(&self, identity: &Identity) -> String {
        format!(
            "{}/v1/projects/{}/serviceAccounts/{}/keys",
            self.base_url, identity.scope, identity.name
        )
    }

    async fn get_key(&self, key: &Key) -> Result<ServiceAccountKeyResource> {
        let response = self
            .http
            .get(self.key_path(key))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "getting service account key"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_http_status(
                status,
                "getting service account key",
                &body,
            ));
        }
        response
            .json()
            .await
            .map_err(|e| Error::from_reqwest(&e, "parsing service account key"))
    }
}

/// Last path segment of `projects/.../keys/{id}`.
fn key_id_from_name(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_string()
}

#[async_trait]
impl KeyOps for GcpKeyOps {
    async fn create(&self, identity: &Identity) -> Result<(Key, Vec<u8>)> {
        debug_assert_eq!(identity.provider, Provider::Gcp);
        let body = serde_json::json!({
            "privateKeyType": "TYPE_GOOGLE_CREDENTIALS_FILE",
            "keyAlgorithm": "KEY_ALG_RSA_2048",
        });
        let response = self
            .http
            .post(self.keys_path(identity))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "creating service account key"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_http_status(
                status,
                "creating service account key",
                &body,
            ));
        }
        let resource: ServiceAccountKeyResource = response
            .json()
            .await
            .map_err(|e| Error::from_reqwest(&e, "parsing created key"))?;

        let id = key_id_from_name(&resource.name);
        let encoded = resource.private_key_data.ok_or_else(|| {
            Error::ProviderUnavailable(format!(
                "{identity}: IAM returned key {id} without private key data"
            ))
        })?;
        let material = BASE64.decode(encoded).map_err(|e| {
            Error::ProviderUnavailable(format!("{identity}: undecodable private key data: {e}"))
        })?;
        info!("issued new service account key {id} for {identity}");
        Ok((
            Key {
                identity: identity.clone(),
                id,
            },
            material,
        ))
    }

    async fn is_disabled(&self, key: &Key) -> Result<bool> {
        Ok(self.get_key(key).await?.disabled)
    }

    async fn ensure_disabled(&self, key: &Key) -> Result<()> {
        if self.get_key(key).await?.disabled {
            debug!("key {} already disabled", key.id);
            return Ok(());
        }
        let response = self
            .http
            .post(format!("{}:disable", self.key_path(key)))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "disabling service account key"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_http_status(
                status,
                "disabling service account key",
                &body,
            ));
        }
        info!("disabled service account key {} for {}", key.id, key.identity);
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        let response = self
            .http
            .delete(self.key_path(key))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "deleting service account key"))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!("key {} already gone at provider", key.id);
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_http_status(
                status,
                "deleting service account key",
                &body,
            ));
        }
        info!("deleted service account key {} for {}", key.id, key.identity);
        Ok(())
    }

    async fn list(&self, identity: &Identity) -> Result<Vec<ProviderKey>> {
        let response = self
            .http
            .get(self.keys_path(identity))
            .query(&[("keyTypes", "USER_MANAGED")])
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "listing service account keys"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_http_status(
                status,
                "listing service account keys",
                &body,
            ));
        }
        let listed: ListKeysResponse = response
            .json()
            .await
            .map_err(|e| Error::from_reqwest(&e, "parsing key list"))?;
        Ok(listed
            .keys
            .into_iter()
            .map(|k| ProviderKey {
                id: key_id_from_name(&k.name),
                created_at: k.valid_after_time,
                disabled: k.disabled,
            })
            .collect())
    }
}
