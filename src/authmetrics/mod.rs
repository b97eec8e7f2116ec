//! # AuthMetrics
//!
//! Answers "when was this credential last used to authenticate?" over a
//! seven-day lookback window by scanning provider telemetry.
//!
//! The Google implementation memoizes a per-project map of
//! `(account, key id) → latest bucket end with a positive count`, built on
//! the first query for that project and reused for the remainder of the
//! reconcile pass. A fresh `AuthMetrics` value is constructed per pass, so
//! staleness is bounded to one pass.
//!
//! Azure publishes no equivalent signal; [`NoAuthMetrics`] always answers
//! "unknown" and the cutoffs decide from there.

use crate::error::Result;
use crate::identity::Identity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

mod gcp;

pub use gcp::GcpAuthMetrics;

/// Days of telemetry scanned per pass.
pub const LOOKBACK_DAYS: i64 = 7;

/// Last-authentication lookup contract.
#[async_trait]
pub trait AuthMetrics: Send + Sync {
    /// Latest observed authentication for `(identity, key_id)` within the
    /// lookback window, or `None` when the window holds no event.
    async fn last_auth_time(
        &self,
        identity: &Identity,
        key_id: &str,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// Provider publishes no usage telemetry. Every lookup answers "unknown".
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthMetrics;

#[async_trait]
impl AuthMetrics for NoAuthMetrics {
    async fn last_auth_time(
        &self,
        _identity: &Identity,
        _key_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }
}
