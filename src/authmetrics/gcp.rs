//! Cloud Monitoring scan for service-account key authentication events.
//!
//! The source metric is `iam.googleapis.com/service_account/key/authn_events_count`,
//! bucketed by `(service account unique ID, key ID)`. Unique IDs are
//! resolved to emails by listing the project's service accounts through the
//! IAM API.
//!
//! References:
//! - [timeSeries.list](https://cloud.google.com/monitoring/api/ref_v3/rest/v3/projects.timeSeries/list)

use super::{AuthMetrics, LOOKBACK_DAYS};
use crate::error::{Error, Result};
use crate::identity::Identity;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_MONITORING_URL: &str = "https://monitoring.googleapis.com";
const DEFAULT_IAM_URL: &str = "https://iam.googleapis.com";
const AUTHN_EVENTS_METRIC: &str = "iam.googleapis.com/service_account/key/authn_events_count";

/// Telemetry buckets longer than this suggest the metric schema drifted.
const MAX_EXPECTED_BUCKET_HOURS: i64 = 12;

type ScopeMemo = HashMap<(String, String), DateTime<Utc>>;

/// Cloud Monitoring implementation of [`AuthMetrics`].
pub struct GcpAuthMetrics {
    http: Client,
    monitoring_url: String,
    iam_url: String,
    access_token: String,
    /// project → ((email, key id) → latest positive bucket end)
    memo: Mutex<HashMap<String, ScopeMemo>>,
}

impl std::fmt::Debug for GcpAuthMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpAuthMetrics")
            .field("monitoring_url", &self.monitoring_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceAccount {
    unique_id: String,
    email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListServiceAccountsResponse {
    #[serde(default)]
    accounts: Vec<ServiceAccount>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeSeriesResponse {
    #[serde(default)]
    time_series: Vec<TimeSeries>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TimeSeries {
    #[serde(default)]
    metric: MetricDescriptor,
    #[serde(default)]
    resource: ResourceDescriptor,
    #[serde(default)]
    points: Vec<Point>,
}

#[derive(Debug, Default, Deserialize)]
struct MetricDescriptor {
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResourceDescriptor {
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Point {
    interval: PointInterval,
    value: PointValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointInterval {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointValue {
    #[serde(default)]
    int64_value: Option<String>,
    #[serde(default)]
    double_value: Option<f64>,
}

impl PointValue {
    fn count(&self) -> i64 {
        if let Some(v) = &self.int64_value {
            return v.parse().unwrap_or(0);
        }
        #[allow(
            clippy::cast_possible_truncation,
            reason = "authn event counts are small integers"
        )]
        self.double_value.map_or(0, |v| v as i64)
    }
}

impl GcpAuthMetrics {
    /// Build a scanner with the production endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn new(access_token: String, request_timeout: std::time::Duration) -> Result<Self> {
        Self::with_base_urls(
            access_token,
            request_timeout,
            DEFAULT_MONITORING_URL.to_string(),
            DEFAULT_IAM_URL.to_string(),
        )
    }

    /// Build a scanner against alternate endpoints (tests).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn with_base_urls(
        access_token: String,
        request_timeout: std::time::Duration,
        monitoring_url: String,
        iam_url: String,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("building monitoring HTTP client: {e}")))?;
        Ok(Self {
            http,
            monitoring_url,
            iam_url,
            access_token,
            memo: Mutex::new(HashMap::new()),
        })
    }

    /// unique ID → email for every service account in the project.
    async fn unique_id_map(&self, project: &str) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .http
                .get(format!("{}/v1/projects/{project}/serviceAccounts", self.iam_url))
                .bearer_auth(&self.access_token);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let response = request
                .send()
                .await
                .map_err(|e| Error::from_reqwest(&e, "listing service accounts"))?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(Error::from_http_status(
                    status,
                    "listing service accounts",
                    &body,
                ));
            }
            let listed: ListServiceAccountsResponse = response
                .json()
                .await
                .map_err(|e| Error::from_reqwest(&e, "parsing service account list"))?;
            for account in listed.accounts {
                map.insert(account.unique_id, account.email);
            }
            match listed.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(map)
    }

    /// Scan the lookback window and build the per-project memo.
    async fn build_memo(&self, project: &str) -> Result<ScopeMemo> {
        let unique_ids = self.unique_id_map(project).await?;
        let now = Utc::now();
        let start = now - Duration::days(LOOKBACK_DAYS);
        let filter = format!(r#"metric.type = "{AUTHN_EVENTS_METRIC}""#);

        let mut memo = ScopeMemo::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .http
                .get(format!("{}/v3/projects/{project}/timeSeries", self.monitoring_url))
                .query(&[
                    ("filter", filter.as_str()),
                    ("interval.startTime", &start.to_rfc3339()),
                    ("interval.endTime", &now.to_rfc3339()),
                ])
                .bearer_auth(&self.access_token);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let response = request
                .send()
                .await
                .map_err(|e| Error::from_reqwest(&e, "querying authn metrics"))?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(Error::from_http_status(status, "querying authn metrics", &body));
            }
            let parsed: TimeSeriesResponse = response
                .json()
                .await
                .map_err(|e| Error::from_reqwest(&e, "parsing authn metrics"))?;

            for series in parsed.time_series {
                let Some(key_id) = series.metric.labels.get("key_id") else {
                    continue;
                };
                let Some(unique_id) = series.resource.labels.get("unique_id") else {
                    continue;
                };
                let Some(email) = unique_ids.get(unique_id) else {
                    debug!("authn metric for unknown service account unique ID {unique_id}");
                    continue;
                };
                for point in &series.points {
                    if point.value.count() <= 0 {
                        continue;
                    }
                    let delta = point.interval.end_time - point.interval.start_time;
                    if delta > Duration::hours(MAX_EXPECTED_BUCKET_HOURS) {
                        warn!(
                            "authn metric bucket for {email}/{key_id} spans {delta}; \
                             telemetry schema may have drifted"
                        );
                    }
                    let slot = memo
                        .entry((email.clone(), key_id.clone()))
                        .or_insert(point.interval.end_time);
                    if point.interval.end_time > *slot {
                        *slot = point.interval.end_time;
                    }
                }
            }

            match parsed.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        debug!(
            "built authn memo for project {project}: {} (account, key) pairs",
            memo.len()
        );
        Ok(memo)
    }
}

#[async_trait]
impl AuthMetrics for GcpAuthMetrics {
    async fn last_auth_time(
        &self,
        identity: &Identity,
        key_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut memo = self.memo.lock().await;
        if !memo.contains_key(&identity.scope) {
            let scope_memo = self.build_memo(&identity.scope).await?;
            memo.insert(identity.scope.clone(), scope_memo);
        }
        Ok(memo
            .get(&identity.scope)
            .and_then(|m| m.get(&(identity.name.clone(), key_id.to_string())))
            .copied())
    }
}
