//! Azure adapter over the Microsoft Graph application API.
//!
//! Application password credentials have no disabled state: they can only
//! be added and removed. `ensure_disabled` is therefore a logical no-op and
//! `is_disabled` reports on bare existence; the reconciler gates deletion
//! purely on elapsed time for this provider.
//!
//! References:
//! - [Graph addPassword](https://learn.microsoft.com/en-us/graph/api/application-addpassword)
//! - [Graph removePassword](https://learn.microsoft.com/en-us/graph/api/application-removepassword)

use super::{Key, KeyOps, ProviderKey};
use crate::error::{Error, Result};
use crate::identity::{Identity, Provider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Microsoft Graph adapter for application password credentials.
///
/// Graph tokens are tenant-scoped, and one pass may touch identities in
/// several tenants; tokens are fetched on demand and memoized per tenant.
pub struct AzureKeyOps {
    http: Client,
    base_url: String,
    /// Overrides per-tenant fetching. Tests only.
    fixed_token: Option<String>,
    tokens: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for AzureKeyOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureKeyOps")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordCredential {
    key_id: String,
    #[serde(default)]
    secret_text: Option<String>,
    #[serde(default)]
    start_date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationCredentials {
    #[serde(default)]
    password_credentials: Vec<PasswordCredential>,
}

impl AzureKeyOps {
    /// Build an adapter with the production Graph endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("building Graph HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            fixed_token: None,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Build an adapter against an alternate endpoint with a fixed token
    /// (tests).
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
            .map_err(|e| Error::Config(format!("building Graph HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            fixed_token: Some(access_token),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    async fn token(&self, tenant_id: &str) -> Result<String> {
        if let Some(token) = &self.fixed_token {
            return Ok(token.clone());
        }
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(tenant_id) {
            return Ok(token.clone());
        }
        let token = crate::auth::azure_access_token(tenant_id).await?;
        tokens.insert(tenant_id.to_string(), token.clone());
        Ok(token)
    }

    fn application_path(&self, identity: &Identity) -> String {
        format!("{}/applications(appId='{}')", self.base_url, identity.name)
    }

    async fn password_credentials(&self, identity: &Identity) -> Result<Vec<PasswordCredential>> {
        let response = self
            .http
            .get(self.application_path(identity))
            .query(&[("$select", "passwordCredentials")])
            .bearer_auth(self.token(&identity.scope).await?)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "reading application credentials"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_http_status(
                status,
                "reading application credentials",
                &body,
            ));
        }
        let app: ApplicationCredentials = response
            .json()
            .await
            .map_err(|e| Error::from_reqwest(&e, "parsing application credentials"))?;
        Ok(app.password_credentials)
    }
}

#[async_trait]
impl KeyOps for AzureKeyOps {
    async fn create(&self, identity: &Identity) -> Result<(Key, Vec<u8>)> {
        debug_assert_eq!(identity.provider, Provider::Azure);
        let body = serde_json::json!({
            "passwordCredential": { "displayName": "yale-managed" }
        });
        let response = self
            .http
            .post(format!("{}/addPassword", self.application_path(identity)))
            .bearer_auth(self.token(&identity.scope).await?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "adding application password"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_http_status(
                status,
                "adding application password",
                &body,
            ));
        }
        let credential: PasswordCredential = response
            .json()
            .await
            .map_err(|e| Error::from_reqwest(&e, "parsing added password"))?;
        let secret = credential.secret_text.ok_or_else(|| {
            Error::ProviderUnavailable(format!(
                "{identity}: Graph returned credential {} without secret text",
                credential.key_id
            ))
        })?;
        info!(
            "issued new client secret {} for {identity}",
            credential.key_id
        );
        Ok((
            Key {
                identity: identity.clone(),
                id: credential.key_id,
            },
            secret.into_bytes(),
        ))
    }

    async fn is_disabled(&self, key: &Key) -> Result<bool> {
        let credentials = self.password_credentials(&key.identity).await?;
        Ok(credentials.iter().any(|c| c.key_id == key.id))
    }

    async fn ensure_disabled(&self, key: &Key) -> Result<()> {
        // Application passwords cannot be disabled, only removed. The
        // reconciler gates deletion on elapsed time instead.
        debug!(
            "ensure_disabled is a no-op for Azure client secret {}",
            key.id
        );
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        let body = serde_json::json!({ "keyId": key.id });
        let response = self
            .http
            .post(format!("{}/removePassword", self.application_path(&key.identity)))
            .bearer_auth(self.token(&key.identity.scope).await?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "removing application password"))?;
        let status = response.status();
        if status.is_success() {
            info!("removed client secret {} for {}", key.id, key.identity);
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND
            || text.contains("No password credential found")
        {
            debug!("client secret {} already gone at provider", key.id);
            return Ok(());
        }
        Err(Error::from_http_status(
            status,
            "removing application password",
            &text,
        ))
    }

    async fn list(&self, identity: &Identity) -> Result<Vec<ProviderKey>> {
        let credentials = self.password_credentials(identity).await?;
        Ok(credentials
            .into_iter()
            .map(|c| ProviderKey {
                id: c.key_id,
                created_at: c.start_date_time,
                disabled: false,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_credentials_parse() {
        let body = r#"{
            "passwordCredentials": [
                {"keyId": "k1", "startDateTime": "2026-03-01T00:00:00Z"},
                {"keyId": "k2"}
            ]
        }"#;
        let parsed: ApplicationCredentials = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.password_credentials.len(), 2);
        assert_eq!(parsed.password_credentials[0].key_id, "k1");
        assert!(parsed.password_credentials[0].start_date_time.is_some());
    }

    #[test]
    fn test_add_password_response_parses_secret_text() {
        let body = r#"{"keyId": "k1", "secretText": "s3cr3t"}"#;
        let parsed: PasswordCredential = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.secret_text.as_deref(), Some("s3cr3t"));
    }
}
