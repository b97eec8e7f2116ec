//! Google Secret Manager sink.
//!
//! Ensures a secret with the declared name exists in the declared project
//! (list-with-filter, create if absent), adds a new version carrying the
//! payload, then reads the latest version back to verify.
//!
//! References:
//! - [Secret Manager REST API v1](https://cloud.google.com/secret-manager/docs/reference/rest)

use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://secretmanager.googleapis.com";

/// Write seam over the GSM sink.
#[async_trait]
pub trait GsmStore: Send + Sync {
    /// Create the secret container if it does not exist yet.
    async fn ensure_secret(&self, project: &str, name: &str) -> Result<()>;

    /// Add a new version holding `payload`.
    async fn add_version(&self, project: &str, name: &str, payload: &[u8]) -> Result<()>;

    /// Payload of the latest version, or `None` if no version is readable.
    async fn access_latest(&self, project: &str, name: &str) -> Result<Option<Vec<u8>>>;
}

/// REST implementation of [`GsmStore`].
pub struct GsmRest {
    http: Client,
    base_url: String,
    /// Absent when no Google token could be sourced; errors only if a
    /// resource actually declares a GSM replication.
    access_token: Option<String>,
}

impl std::fmt::Debug for GsmRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GsmRest")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ListSecretsResponse {
    #[serde(default)]
    secrets: Vec<SecretResource>,
}

#[derive(Debug, Deserialize)]
struct SecretResource {
    /// `projects/{p}/secrets/{name}`
    name: String,
}

#[derive(Debug, Deserialize)]
struct AccessSecretVersionResponse {
    payload: SecretPayload,
}

#[derive(Debug, Deserialize)]
struct SecretPayload {
    /// Base64-encoded secret data
    data: String,
}

impl GsmRest {
    /// Build a sink with the production endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn new(access_token: Option<String>, request_timeout: Duration) -> Result<Self> {
        Self::with_base_url(access_token, request_timeout, DEFAULT_BASE_URL.to_string())
    }

    /// Build a sink against an alternate endpoint (tests).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn with_base_url(
        access_token: Option<String>,
        request_timeout: Duration,
        base_url: String,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("building GSM HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            access_token,
        })
    }

    fn token(&self) -> Result<&str> {
        self.access_token.as_deref().ok_or_else(|| {
            Error::Config(
                "GSM replication declared but no Google access token is available".to_string(),
            )
        })
    }
}

#[async_trait]
impl GsmStore for GsmRest {
    async fn ensure_secret(&self, project: &str, name: &str) -> Result<()> {
        let filter = format!("name:{name}");
        let response = self
            .http
            .get(format!("{}/v1/projects/{project}/secrets", self.base_url))
            .query(&[("filter", filter.as_str())])
            .bearer_auth(self.token()?)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "listing GSM secrets"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_http_status(status, "listing GSM secrets", &body));
        }
        let listed: ListSecretsResponse = response
            .json()
            .await
            .map_err(|e| Error::from_reqwest(&e, "parsing GSM secret list"))?;

        let full_name = format!("projects/{project}/secrets/{name}");
        if listed.secrets.iter().any(|s| s.name == full_name) {
            return Ok(());
        }

        debug!("creating GSM secret {project}/{name}");
        let body = serde_json::json!({ "replication": { "automatic": {} } });
        let response = self
            .http
            .post(format!("{}/v1/projects/{project}/secrets", self.base_url))
            .query(&[("secretId", name)])
            .bearer_auth(self.token()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "creating GSM secret"))?;
        let status = response.status();
        // A concurrent creator winning the race is fine.
        if status == reqwest::StatusCode::CONFLICT || status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::from_http_status(status, "creating GSM secret", &body))
    }

    async fn add_version(&self, project: &str, name: &str, payload: &[u8]) -> Result<()> {
        let body = serde_json::json!({
            "payload": { "data": BASE64.encode(payload) }
        });
        let response = self
            .http
            .post(format!(
                "{}/v1/projects/{project}/secrets/{name}:addVersion",
                self.base_url
            ))
            .bearer_auth(self.token()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "adding GSM secret version"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_http_status(
                status,
                "adding GSM secret version",
                &body,
            ));
        }
        Ok(())
    }

    async fn access_latest(&self, project: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .http
            .get(format!(
                "{}/v1/projects/{project}/secrets/{name}/versions/latest:access",
                self.base_url
            ))
            .bearer_auth(self.token()?)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "accessing GSM secret version"))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_http_status(
                status,
                "accessing GSM secret version",
                &body,
            ));
        }
        let accessed: AccessSecretVersionResponse = response
            .json()
            .await
            .map_err(|e| Error::from_reqwest(&e, "parsing GSM secret version"))?;
        let data = BASE64.decode(accessed.payload.data).map_err(|e| {
            Error::ProviderUnavailable(format!("undecodable GSM payload for {name}: {e}"))
        })?;
        Ok(Some(data))
    }
}
