//! Best-effort Slack notifications for key rotations.
//!
//! The webhook URL comes from `YALE_SLACK_WEBHOOK_URL`. Delivery failures
//! are logged and swallowed; notifications never fail a reconcile.

use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable carrying the incoming-webhook URL.
pub const WEBHOOK_ENV: &str = "YALE_SLACK_WEBHOOK_URL";

#[derive(Clone)]
pub struct SlackNotifier {
    http: Client,
    webhook_url: String,
}

impl std::fmt::Debug for SlackNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackNotifier").finish_non_exhaustive()
    }
}

impl SlackNotifier {
    /// Build a notifier from the environment, or `None` when no webhook is
    /// configured.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let webhook_url = std::env::var(WEBHOOK_ENV).ok()?;
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .ok()?;
        Some(Self { http, webhook_url })
    }

    /// Post `text` to the webhook. Never fails the caller.
    pub async fn notify(&self, text: &str) {
        let body = serde_json::json!({ "text": text });
        match self.http.post(&self.webhook_url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("slack notification delivered");
            }
            Ok(response) => {
                warn!("slack webhook returned {}", response.status());
            }
            Err(e) => {
                warn!("slack notification failed: {e}");
            }
        }
    }
}
