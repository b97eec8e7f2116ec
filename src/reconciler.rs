//! # Reconciler
//!
//! Drives each identity's credentials through the lifecycle state machine:
//!
//! 1. Aggregate cutoffs from the resources targeting the identity
//! 2. Rotate: retire an over-age active key, issue a replacement
//! 3. Sync: fan the active key out to every declared sink
//! 4. Disable: rotated keys past the disable cutoff, gated on last use
//! 5. Delete: disabled keys past their quarantine
//! 6. Garbage-collect Entries with no resources and no keys left
//!
//! Every provider mutation is followed by a cache persist before the next
//! logical step, and a freshly issued key is persisted *before* any sink
//! write (the write-ahead rule), so a credential observable at the
//! provider is always observable in the cache first.
//!
//! A pass processes identities concurrently under a bounded worker pool;
//! within one identity, steps are strictly sequential. Failure in one
//! identity never aborts the rest of the pass.

use crate::authmetrics::AuthMetrics;
use crate::cache::Cache;
use crate::cli::RotateWindow;
use crate::collector::ConsumerResource;
use crate::cutoffs::Cutoffs;
use crate::error::{Error, Result};
use crate::identity::{Identity, Provider};
use crate::keyops::{Key, KeyOps};
use crate::keysync::KeySync;
use crate::slack::SlackNotifier;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Legacy annotation carrying the active key ID, read once when a cache
/// Entry does not exist yet.
pub const LEGACY_KEY_ID_ANNOTATION: &str = "yale.terra.bio/current-key-id";
/// Legacy annotation carrying the active key issuance time, RFC 3339.
pub const LEGACY_KEY_CREATED_AT_ANNOTATION: &str = "yale.terra.bio/current-key-created-at";

/// Pass-level switches, resolved from flags.
#[derive(Debug, Clone)]
pub struct PassOptions {
    /// Gate disablement on the last-authentication check
    pub check_in_use: bool,
    /// Confine rotations to this window; disable/delete always run
    pub rotate_window: Option<RotateWindow>,
    /// Bounded worker pool size across identities
    pub concurrency: usize,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            check_in_use: true,
            rotate_window: None,
            concurrency: 8,
        }
    }
}

/// Outcome of one pass. The process exits non-zero if `failures` is
/// non-empty.
#[derive(Debug)]
pub struct PassOutcome {
    pub identities: usize,
    pub failures: Vec<(Identity, Error)>,
}

impl PassOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Orchestrator over cache, key operations, metrics and keysync.
pub struct Reconciler {
    cache: Arc<dyn Cache>,
    keysync: Arc<dyn KeySync>,
    gcp_keyops: Option<Arc<dyn KeyOps>>,
    azure_keyops: Option<Arc<dyn KeyOps>>,
    gcp_metrics: Arc<dyn AuthMetrics>,
    slack: Option<SlackNotifier>,
    options: PassOptions,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Race `future` against cancellation.
async fn with_cancel<T, F>(cancel: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = future => result,
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        cache: Arc<dyn Cache>,
        keysync: Arc<dyn KeySync>,
        gcp_keyops: Option<Arc<dyn KeyOps>>,
        azure_keyops: Option<Arc<dyn KeyOps>>,
        gcp_metrics: Arc<dyn AuthMetrics>,
        slack: Option<SlackNotifier>,
        options: PassOptions,
    ) -> Self {
        Self {
            cache,
            keysync,
            gcp_keyops,
            azure_keyops,
            gcp_metrics,
            slack,
            options,
        }
    }

    /// Run one pass over the collected identity groups.
    ///
    /// Cache Entries whose identity no longer has any consumer resource are
    /// appended as empty groups so their keys still age out and the Entry
    /// is eventually garbage-collected.
    ///
    /// # Errors
    ///
    /// Only the initial cache listing can fail the pass as a whole; every
    /// per-identity failure is reported through [`PassOutcome::failures`].
    pub async fn run(
        &self,
        mut groups: HashMap<Identity, Vec<ConsumerResource>>,
        cancel: &CancellationToken,
    ) -> Result<PassOutcome> {
        for entry in self.cache.list().await? {
            groups.entry(entry.identity).or_default();
        }

        let identities = groups.len();
        info!("reconciling {identities} identities");

        let results: Vec<(Identity, Result<()>)> = futures::stream::iter(groups)
            .map(|(identity, resources)| async move {
                let outcome = self.reconcile_identity(&identity, &resources, cancel).await;
                (identity, outcome)
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        let failures: Vec<(Identity, Error)> = results
            .into_iter()
            .filter_map(|(identity, outcome)| match outcome {
                Ok(()) => None,
                Err(e) => {
                    warn!("reconcile failed for {identity}: {e}");
                    Some((identity, e))
                }
            })
            .collect();

        Ok(PassOutcome {
            identities,
            failures,
        })
    }

    fn keyops_for(&self, provider: Provider) -> Result<&Arc<dyn KeyOps>> {
        let slot = match provider {
            Provider::Gcp => &self.gcp_keyops,
            Provider::Azure => &self.azure_keyops,
        };
        slot.as_ref().ok_or_else(|| {
            Error::Config(format!("no {provider} key-operations client configured"))
        })
    }

    fn rotation_allowed(&self, now: DateTime<Utc>) -> bool {
        match &self.options.rotate_window {
            None => true,
            Some(window) => window.contains(now.time()),
        }
    }

    /// Drive one identity through the full state machine.
    ///
    /// # Errors
    ///
    /// The first failing step aborts this identity; the pass continues with
    /// the others.
    pub async fn reconcile_identity(
        &self,
        identity: &Identity,
        resources: &[ConsumerResource],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        for resource in resources {
            resource.validate()?;
        }

        let now = Utc::now();
        let cutoffs = Cutoffs::aggregate(
            identity,
            resources.iter().map(|r| &r.key_rotation),
            now,
        );
        let mut entry = self.cache.get_or_create(identity).await?;
        let keyops = self.keyops_for(identity.provider)?;

        self.rotate_step(identity, resources, &cutoffs, &mut entry, keyops, cancel)
            .await?;

        if !resources.is_empty() {
            self.keysync
                .sync(self.cache.as_ref(), &mut entry, resources)
                .await?;
        }

        self.disable_step(identity, &cutoffs, &mut entry, keyops, cancel)
            .await?;
        self.delete_step(identity, &cutoffs, &mut entry, keyops, cancel)
            .await?;

        if resources.is_empty() && entry.is_empty() && entry.sync_status.is_empty() {
            info!("{identity}: no resources and no keys left; deleting cache entry");
            self.cache.delete(identity).await?;
        }
        Ok(())
    }

    /// Rotate step: retire an over-age active key and issue a replacement.
    async fn rotate_step(
        &self,
        identity: &Identity,
        resources: &[ConsumerResource],
        cutoffs: &Cutoffs,
        entry: &mut crate::cache::Entry,
        keyops: &Arc<dyn KeyOps>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let now = Utc::now();
        if !self.rotation_allowed(now) {
            debug!("{identity}: outside rotate window; skipping rotate step");
            return Ok(());
        }

        adopt_legacy_annotations(entry, resources);

        let mut rotated_key_id = None;
        let rotation_due = entry
            .current_key
            .as_ref()
            .is_some_and(|current| cutoffs.should_rotate(current.created_at));
        if rotation_due {
            if let Some(id) = entry.rotate_current(now) {
                info!(
                    "{identity}: key {id} exceeded {} days; rotated",
                    cutoffs.rotate_after_days()
                );
                rotated_key_id = Some(id);
                entry.check_invariants(now)?;
                self.cache.save(entry).await?;
            }
        }

        if entry.current_key.is_none() && !resources.is_empty() {
            self.adopt_orphans(identity, cutoffs, entry, keyops, cancel)
                .await?;
        }

        if entry.current_key.is_none() && !resources.is_empty() {
            let (key, material) =
                with_cancel(cancel, keyops.create(identity)).await?;
            let created_at = Utc::now();
            entry.promote(key.id.clone(), material, created_at)?;
            entry.check_invariants(created_at)?;
            // Write-ahead: the cache must know about the key before any
            // sink does.
            self.cache.save(entry).await?;
            info!("{identity}: issued new key {}", key.id);

            if let Some(slack) = &self.slack {
                let text = match rotated_key_id {
                    Some(old) => format!(
                        "Yale rotated the key for `{identity}`: `{old}` superseded by `{}`",
                        key.id
                    ),
                    None => format!("Yale issued a new key `{}` for `{identity}`", key.id),
                };
                slack.notify(&text).await;
            }
        }
        Ok(())
    }

    /// Adopt a provider-side key the cache does not know about.
    ///
    /// Happens only when the Entry has no active key, which is the one
    /// state a crash between provider create and cache save can leave
    /// behind. Only the single newest untracked, non-disabled key created
    /// within the rotate window is adoptable: a key that young is one
    /// Yale's own schedule could have issued, while anything older belongs
    /// to someone else and is left untouched. No material can be recovered
    /// on this path, so the adopted key goes straight into the rotated
    /// container and ages out normally while a fresh key with material is
    /// issued in the same pass.
    async fn adopt_orphans(
        &self,
        identity: &Identity,
        cutoffs: &Cutoffs,
        entry: &mut crate::cache::Entry,
        keyops: &Arc<dyn KeyOps>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if identity.provider != Provider::Gcp {
            // Azure secret material is returned exactly once at create;
            // stray credentials cannot be recovered, so a fresh secret is
            // issued instead.
            return Ok(());
        }
        let provider_keys = with_cancel(cancel, keyops.list(identity)).await?;
        let tracked = entry.all_key_ids();
        let newest = provider_keys
            .into_iter()
            .filter(|k| !tracked.contains(&k.id) && !k.disabled)
            .filter_map(|k| k.created_at.map(|at| (k.id, at)))
            .filter(|(_, created_at)| !cutoffs.should_rotate(*created_at))
            .max_by_key(|(_, created_at)| *created_at);
        let Some((key_id, created_at)) = newest else {
            return Ok(());
        };

        warn!("{identity}: adopting untracked provider key {key_id} into rotated set");
        let now = Utc::now();
        entry.rotated_keys.insert(key_id, created_at);
        entry.check_invariants(now)?;
        self.cache.save(entry).await?;
        Ok(())
    }

    /// Disable step: rotated keys past the cutoff, gated on usage.
    async fn disable_step(
        &self,
        identity: &Identity,
        cutoffs: &Cutoffs,
        entry: &mut crate::cache::Entry,
        keyops: &Arc<dyn KeyOps>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let candidates: Vec<(String, DateTime<Utc>)> = entry
            .rotated_keys
            .iter()
            .map(|(id, at)| (id.clone(), *at))
            .collect();

        for (key_id, rotated_at) in candidates {
            if !cutoffs.should_disable(rotated_at) {
                continue;
            }

            if self.options.check_in_use && !cutoffs.ignore_usage_metrics() {
                let metrics = self.metrics_for(identity.provider);
                let last_auth = with_cancel(
                    cancel,
                    metrics.last_auth_time(identity, &key_id),
                )
                .await?
                .unwrap_or(DateTime::UNIX_EPOCH);
                if !cutoffs.safe_to_disable(last_auth) {
                    warn!(
                        "{identity}: key {key_id} authenticated at {last_auth}; deferring disable"
                    );
                    continue;
                }
            }

            let key = Key {
                identity: identity.clone(),
                id: key_id.clone(),
            };
            with_cancel(cancel, keyops.ensure_disabled(&key)).await?;
            let now = Utc::now();
            entry.mark_disabled(&key_id, now)?;
            entry.check_invariants(now)?;
            self.cache.save(entry).await?;
            info!("{identity}: disabled key {key_id}");
        }
        Ok(())
    }

    /// Delete step: disabled keys past their quarantine.
    async fn delete_step(
        &self,
        identity: &Identity,
        cutoffs: &Cutoffs,
        entry: &mut crate::cache::Entry,
        keyops: &Arc<dyn KeyOps>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let candidates: Vec<(String, DateTime<Utc>)> = entry
            .disabled_keys
            .iter()
            .map(|(id, at)| (id.clone(), *at))
            .collect();

        for (key_id, disabled_at) in candidates {
            if !cutoffs.should_delete(disabled_at) {
                continue;
            }
            let key = Key {
                identity: identity.clone(),
                id: key_id.clone(),
            };
            with_cancel(cancel, keyops.delete(&key)).await?;
            entry.remove_deleted(&key_id);
            self.cache.save(entry).await?;
            info!("{identity}: deleted key {key_id}");
        }
        Ok(())
    }

    fn metrics_for(&self, provider: Provider) -> &Arc<dyn AuthMetrics> {
        match provider {
            Provider::Gcp => &self.gcp_metrics,
            // Azure publishes no last-auth signal; the static fallback
            // always answers "unknown", which safe_to_disable treats as
            // the epoch.
            Provider::Azure => {
                static NONE: std::sync::OnceLock<Arc<dyn AuthMetrics>> = std::sync::OnceLock::new();
                NONE.get_or_init(|| Arc::new(crate::authmetrics::NoAuthMetrics))
            }
        }
    }
}

/// Synthesize an Entry from legacy per-resource annotations when the cache
/// holds nothing for this identity. Material is not recoverable from
/// annotations; the adopted key carries an empty payload and sinks resync
/// on the next rotation.
fn adopt_legacy_annotations(entry: &mut crate::cache::Entry, resources: &[ConsumerResource]) {
    if entry.current_key.is_some() || !entry.is_empty() || !entry.sync_status.is_empty() {
        return;
    }
    for resource in resources {
        let Some(key_id) = resource.annotations.get(LEGACY_KEY_ID_ANNOTATION) else {
            continue;
        };
        let created_at = resource
            .annotations
            .get(LEGACY_KEY_CREATED_AT_ANNOTATION)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map_or_else(Utc::now, |t| t.with_timezone(&Utc));
        if entry
            .promote(key_id.clone(), Vec::new(), created_at)
            .is_ok()
        {
            info!(
                "{}: adopted legacy key {key_id} from annotations on {}",
                entry.identity,
                resource.resource_key()
            );
        }
        return;
    }
}
