//! GitHub repository-secret sink.
//!
//! Fetches the repository public key, seals the payload with a libsodium
//! sealed box (ephemeral X25519 sender keypair, XSalsa20-Poly1305, nonce
//! derived with Blake2b over sender and recipient public keys) and PUTs
//! the ciphertext as a named repository secret. Actions and Dependabot
//! secrets live under parallel API prefixes. Write-only: GitHub offers no
//! read-back of secret values.
//!
//! References:
//! - [Actions secrets REST API](https://docs.github.com/en/rest/actions/secrets)
//! - [Dependabot secrets REST API](https://docs.github.com/en/rest/dependabot/secrets)

use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crypto_box::aead::OsRng;
use crypto_box::PublicKey;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("yale/", env!("CARGO_PKG_VERSION"));

/// Which GitHub secret store a replication targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GithubApp {
    Actions,
    Dependabot,
}

impl GithubApp {
    fn api_segment(self) -> &'static str {
        match self {
            GithubApp::Actions => "actions",
            GithubApp::Dependabot => "dependabot",
        }
    }
}

/// Write seam over the GitHub sink.
#[async_trait]
pub trait GithubStore: Send + Sync {
    /// Seal `payload` with the repo public key and store it under `name`.
    async fn put_secret(
        &self,
        repo: &str,
        app: GithubApp,
        name: &str,
        payload: &[u8],
    ) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct RepoPublicKey {
    key_id: String,
    /// Base64-encoded X25519 public key
    key: String,
}

/// REST implementation of [`GithubStore`].
pub struct GithubRest {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for GithubRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubRest")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GithubRest {
    /// Build a sink reading the token from `GITHUB_TOKEN`. A missing token
    /// errors only if a resource actually declares a GitHub replication.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn from_env(request_timeout: Duration) -> Result<Self> {
        Self::with_base_url(
            std::env::var("GITHUB_TOKEN").ok(),
            request_timeout,
            DEFAULT_BASE_URL.to_string(),
        )
    }

    /// Build a sink against an alternate endpoint (tests).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn with_base_url(
        token: Option<String>,
        request_timeout: Duration,
        base_url: String,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Config(format!("building GitHub HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    fn token(&self) -> Result<&str> {
        self.token.as_deref().ok_or_else(|| {
            Error::Config(
                "GitHub replication declared but GITHUB_TOKEN is not set".to_string(),
            )
        })
    }

    async fn public_key(&self, repo: &str, app: GithubApp) -> Result<RepoPublicKey> {
        let response = self
            .http
            .get(format!(
                "{}/repos/{repo}/{}/secrets/public-key",
                self.base_url,
                app.api_segment()
            ))
            .bearer_auth(self.token()?)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "fetching repo public key"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_http_status(
                status,
                "fetching repo public key",
                &body,
            ));
        }
        response
            .json()
            .await
            .map_err(|e| Error::from_reqwest(&e, "parsing repo public key"))
    }
}

/// Seal `payload` for `recipient_key` (base64 X25519 public key) with an
/// ephemeral sender keypair.
///
/// # Errors
///
/// Returns [`Error::Config`] for an undecodable recipient key.
pub fn seal_for_repo(recipient_key_b64: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(recipient_key_b64)
        .map_err(|e| Error::Config(format!("undecodable repo public key: {e}")))?;
    let key_bytes: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| Error::Config("repo public key is not 32 bytes".to_string()))?;
    let recipient = PublicKey::from(key_bytes);
    recipient
        .seal(&mut OsRng, payload)
        .map_err(|e| Error::Config(format!("sealing payload: {e}")))
}

#[async_trait]
impl GithubStore for GithubRest {
    async fn put_secret(
        &self,
        repo: &str,
        app: GithubApp,
        name: &str,
        payload: &[u8],
    ) -> Result<()> {
        let public_key = self.public_key(repo, app).await?;
        let sealed = seal_for_repo(&public_key.key, payload)?;

        let body = serde_json::json!({
            "encrypted_value": BASE64.encode(sealed),
            "key_id": public_key.key_id,
        });
        let response = self
            .http
            .put(format!(
                "{}/repos/{repo}/{}/secrets/{name}",
                self.base_url,
                app.api_segment()
            ))
            .bearer_auth(self.token()?)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "storing repo secret"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_http_status(status, "storing repo secret", &body));
        }
        debug!("stored {} secret {name} in {repo}", app.api_segment());
        Ok(())
    }
}
