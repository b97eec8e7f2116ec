//! # Cutoffs
//!
//! Aggregates the rotation policies of every resource pointing at one
//! identity into a single set of effective thresholds, then answers the
//! time-based questions the reconciler asks.
//!
//! Aggregation takes the minimum of each day-threshold across resources and
//! rounds up to a floor. The floors exist because provider usage telemetry
//! is published with up to a 6-hour lag; thresholds tighter than the floors
//! risk disabling a key still in live use.

use crate::crd::KeyRotation;
use crate::identity::Identity;
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

/// Minimum days before an active key may be rotated.
pub const ROTATE_FLOOR_DAYS: u32 = 7;
/// Minimum days a rotated key stays enabled before disablement.
pub const DISABLE_FLOOR_DAYS: u32 = 7;
/// Minimum days a disabled key is quarantined before deletion.
pub const DELETE_FLOOR_DAYS: u32 = 3;
/// A key authenticated within this window is never disabled.
pub const SAFE_DISABLE_LAG_DAYS: i64 = 3;

/// Effective thresholds for one identity, frozen at pass time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cutoffs {
    rotate_after_days: u32,
    disable_after_days: u32,
    delete_after_days: u32,
    ignore_usage_metrics: bool,
    now: DateTime<Utc>,
}

impl Cutoffs {
    /// Aggregate the policies of all resources targeting `identity`.
    ///
    /// Day thresholds take the minimum across resources, floored. If
    /// resources disagree on `ignore_usage_metrics` the conservative value
    /// (`false`) wins. Disagreements are logged at warn level. An empty
    /// policy set (all consumer resources deleted but keys still aging out)
    /// yields the floors.
    #[must_use]
    pub fn aggregate<'a, I>(identity: &Identity, policies: I, now: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = &'a KeyRotation>,
    {
        let policies: Vec<&KeyRotation> = policies.into_iter().collect();

        let days = |label: &str, values: Vec<u32>, floor: u32| -> u32 {
            let Some(min) = values.iter().copied().min() else {
                return floor;
            };
            if values.iter().any(|v| *v != min) {
                warn!("{identity}: resources disagree on {label} ({values:?}); using minimum {min}");
            }
            if min < floor {
                warn!("{identity}: {label} {min} is below the floor of {floor} days; using {floor}");
            }
            min.max(floor)
        };

        let rotate_after_days = days(
            "rotateAfter",
            policies.iter().map(|p| p.rotate_after).collect(),
            ROTATE_FLOOR_DAYS,
        );
        let disable_after_days = days(
            "disableAfter",
            policies.iter().map(|p| p.disable_after).collect(),
            DISABLE_FLOOR_DAYS,
        );
        let delete_after_days = days(
            "deleteAfter",
            policies.iter().map(|p| p.delete_after).collect(),
            DELETE_FLOOR_DAYS,
        );

        let votes: Vec<bool> = policies.iter().map(|p| p.ignore_usage_metrics).collect();
        let ignore_usage_metrics = if votes.is_empty() {
            false
        } else if votes.iter().all(|v| *v) {
            true
        } else {
            if votes.iter().any(|v| *v) {
                warn!("{identity}: resources disagree on ignoreUsageMetrics; defaulting to false");
            }
            false
        };

        Self {
            rotate_after_days,
            disable_after_days,
            delete_after_days,
            ignore_usage_metrics,
            now,
        }
    }

    /// True if a key created at `created_at` is due for rotation.
    #[must_use]
    pub fn should_rotate(&self, created_at: DateTime<Utc>) -> bool {
        created_at < self.now - Duration::days(i64::from(self.rotate_after_days))
    }

    /// True if a key rotated at `rotated_at` is due for disablement.
    #[must_use]
    pub fn should_disable(&self, rotated_at: DateTime<Utc>) -> bool {
        rotated_at < self.now - Duration::days(i64::from(self.disable_after_days))
    }

    /// True if a key disabled at `disabled_at` is past its quarantine.
    #[must_use]
    pub fn should_delete(&self, disabled_at: DateTime<Utc>) -> bool {
        disabled_at < self.now - Duration::days(i64::from(self.delete_after_days))
    }

    /// True if a key whose last authentication was at `last_auth` may be
    /// disabled without risking a live credential.
    #[must_use]
    pub fn safe_to_disable(&self, last_auth: DateTime<Utc>) -> bool {
        self.ignore_usage_metrics || last_auth < self.now - Duration::days(SAFE_DISABLE_LAG_DAYS)
    }

    #[must_use]
    pub fn rotate_after_days(&self) -> u32 {
        self.rotate_after_days
    }

    #[must_use]
    pub fn disable_after_days(&self) -> u32 {
        self.disable_after_days
    }

    #[must_use]
    pub fn delete_after_days(&self) -> u32 {
        self.delete_after_days
    }

    #[must_use]
    pub fn ignore_usage_metrics(&self) -> bool {
        self.ignore_usage_metrics
    }

    #[cfg(test)]
    #[must_use]
    pub fn fixed(
        rotate: u32,
        disable: u32,
        delete: u32,
        ignore_usage_metrics: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            rotate_after_days: rotate,
            disable_after_days: disable,
            delete_after_days: delete,
            ignore_usage_metrics,
            now,
        }
    }
}
