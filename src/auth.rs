//! # Provider Authentication
//!
//! OAuth2 access tokens for the REST adapters.
//!
//! GCP tokens come from the GKE/GCE metadata server (Workload Identity),
//! falling back to `gcloud auth print-access-token` for operator-local
//! runs. Azure tokens come from a client-credentials grant against the
//! tenant's token endpoint, falling back to the IMDS managed-identity
//! endpoint when no client credentials are in the environment.

use crate::error::{Error, Result};
use std::time::Duration;
use tracing::{debug, info};

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const AZURE_IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
}

fn token_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| Error::Config(format!("building token HTTP client: {e}")))
}

/// Fetch a Google OAuth2 access token.
///
/// Tries the metadata server first (Workload Identity); when `local` is set
/// and the metadata server is unreachable, shells out to
/// `gcloud auth print-access-token`.
///
/// # Errors
///
/// Returns [`Error::PermissionDenied`] when no token source yields a token.
pub async fn google_access_token(local: bool) -> Result<String> {
    let client = token_client()?;

    match client
        .get(METADATA_TOKEN_URL)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| Error::from_reqwest(&e, "parsing metadata token response"))?;
            info!("retrieved access token from metadata server (Workload Identity)");
            return Ok(token.access_token);
        }
        Ok(response) => {
            debug!("metadata server returned status {}", response.status());
        }
        Err(e) => {
            debug!("metadata server not available: {e}");
        }
    }

    if local {
        let output = tokio::process::Command::new("gcloud")
            .args(["auth", "print-access-token"])
            .output()
            .await
            .map_err(|e| Error::Config(format!("running gcloud: {e}")))?;
        if output.status.success() {
            let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !token.is_empty() {
                info!("retrieved access token from gcloud (local mode)");
                return Ok(token);
            }
        }
    }

    Err(Error::PermissionDenied(
        "no Google access token available: metadata server unreachable and gcloud fallback \
         disabled or failed"
            .to_string(),
    ))
}

/// Fetch a Microsoft Graph access token for `tenant_id`.
///
/// Uses a client-credentials grant when `AZURE_CLIENT_ID` and
/// `AZURE_CLIENT_SECRET` are set, otherwise the IMDS managed-identity
/// endpoint.
///
/// # Errors
///
/// Returns [`Error::PermissionDenied`] when neither source yields a token.
pub async fn azure_access_token(tenant_id: &str) -> Result<String> {
    let client = token_client()?;

    if let (Ok(client_id), Ok(client_secret)) = (
        std::env::var("AZURE_CLIENT_ID"),
        std::env::var("AZURE_CLIENT_SECRET"),
    ) {
        let token_url =
            format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token");
        let params = [
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("scope", GRAPH_SCOPE),
            ("grant_type", "client_credentials"),
        ];
        let response = client
            .post(&token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&e, "requesting Azure token"))?;
        if response.status().is_success() {
            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| Error::from_reqwest(&e, "parsing Azure token response"))?;
            info!("retrieved Graph access token via client credentials");
            return Ok(token.access_token);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::from_http_status(status, "Azure token endpoint", &body));
    }

    match client
        .get(AZURE_IMDS_TOKEN_URL)
        .query(&[
            ("api-version", "2018-02-01"),
            ("resource", "https://graph.microsoft.com/"),
        ])
        .header("Metadata", "true")
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| Error::from_reqwest(&e, "parsing IMDS token response"))?;
            info!("retrieved Graph access token from IMDS (managed identity)");
            Ok(token.access_token)
        }
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(Error::from_http_status(status, "Azure IMDS", &body))
        }
        Err(e) => Err(Error::PermissionDenied(format!(
            "no Azure access token available: client credentials unset and IMDS unreachable: {e}"
        ))),
    }
}
