//! End-to-end lifecycle scenarios over in-memory fakes.
//!
//! These exercise the full reconciler state machine: issue, rotate, sync
//! fan-out, usage-gated disable, quarantined delete, orphan adoption and
//! empty-entry garbage collection.

mod common;

use chrono::{Duration, Utc};
use common::{
    FakeAuthMetrics, FakeKeyOps, InMemoryCache, MemoryClusterSecrets, MemoryGithub, MemoryGsm,
    MemoryVault, FAKE_MATERIAL,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use yale::cache::{CurrentKey, Entry};
use yale::collector::ConsumerResource;
use yale::crd::{Format, KeyRotation, Replication, SecretSpec};
use yale::error::Error;
use yale::identity::Identity;
use yale::keysync::Replicator;
use yale::reconciler::{PassOptions, Reconciler};

struct Harness {
    cache: Arc<InMemoryCache>,
    keyops: Arc<FakeKeyOps>,
    cluster: Arc<MemoryClusterSecrets>,
    vault: Arc<MemoryVault>,
    gsm: Arc<MemoryGsm>,
    github: Arc<MemoryGithub>,
    reconciler: Reconciler,
}

fn harness(keyops: FakeKeyOps, metrics: FakeAuthMetrics, options: PassOptions) -> Harness {
    let cache = Arc::new(InMemoryCache::default());
    let keyops = Arc::new(keyops);
    let cluster = Arc::new(MemoryClusterSecrets::default());
    let vault = Arc::new(MemoryVault::default());
    let gsm = Arc::new(MemoryGsm::default());
    let github = Arc::new(MemoryGithub::default());

    let keysync = Arc::new(Replicator::new(
        cluster.clone(),
        vault.clone(),
        gsm.clone(),
        github.clone(),
    ));
    let reconciler = Reconciler::new(
        cache.clone(),
        keysync,
        Some(keyops.clone() as Arc<dyn yale::keyops::KeyOps>),
        Some(keyops.clone() as Arc<dyn yale::keyops::KeyOps>),
        Arc::new(metrics),
        None,
        options,
    );
    Harness {
        cache,
        keyops,
        cluster,
        vault,
        gsm,
        github,
        reconciler,
    }
}

fn gcp_identity() -> Identity {
    Identity::gcp("p", "sa@p.iam.gserviceaccount.com")
}

fn gcp_resource(rotate: u32, disable: u32, delete: u32) -> ConsumerResource {
    ConsumerResource {
        kind: "GcpSaKey".to_string(),
        api_version: "yale.terra.bio/v1beta1".to_string(),
        namespace: "terra-dev".to_string(),
        name: "my-service".to_string(),
        uid: Some("uid-1".to_string()),
        annotations: BTreeMap::new(),
        identity: gcp_identity(),
        key_rotation: KeyRotation {
            rotate_after: rotate,
            disable_after: disable,
            delete_after: delete,
            ignore_usage_metrics: false,
        },
        secret: Some(SecretSpec {
            name: "my-service-sa-secret".to_string(),
            json_key_name: Some("key.json".to_string()),
            pem_key_name: Some("key.pem".to_string()),
        }),
        replications: vec![Replication::Vault {
            path: "secret/dsde/my-service".to_string(),
            key: "sa-key".to_string(),
            format: Format::Json,
        }],
    }
}

fn seed_with_current(cache: &InMemoryCache, id: &str, age_days: i64) -> Entry {
    let mut entry = Entry::new(gcp_identity());
    entry.current_key = Some(CurrentKey {
        id: id.to_string(),
        material: FAKE_MATERIAL.as_bytes().to_vec(),
        created_at: Utc::now() - Duration::days(age_days),
    });
    cache.seed(&entry);
    entry
}

/// Every key the provider holds must be tracked somewhere in the Entry.
fn assert_write_ahead(h: &Harness, identity: &Identity) {
    let entry = h.cache.entry(identity).expect("entry should exist");
    let tracked = entry.all_key_ids();
    for id in h.keyops.existing.lock().unwrap().iter() {
        assert!(
            tracked.contains(id),
            "provider key {id} is untracked by the cache entry"
        );
    }
}

#[tokio::test]
async fn test_fresh_identity_issues_key_and_syncs() {
    let h = harness(
        FakeKeyOps::default(),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    let resources = vec![gcp_resource(30, 14, 3)];
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &resources, &cancel)
        .await
        .unwrap();

    let entry = h.cache.entry(&identity).unwrap();
    let current = entry.current_key.as_ref().unwrap();
    assert_eq!(current.id, "key-1");
    assert!(entry.rotated_keys.is_empty());
    assert!(entry.disabled_keys.is_empty());

    // Sync determinism: status records the active key.
    let status = entry.sync_status.get("terra-dev/my-service").unwrap();
    assert_eq!(status.last_synced_key_id, "key-1");

    // Cluster secret landed with both declared fields and annotations.
    let secret = h.cluster.latest("terra-dev", "my-service-sa-secret").unwrap();
    let data = secret.data.unwrap();
    assert_eq!(data.get("key.json").unwrap().0, FAKE_MATERIAL.as_bytes());
    assert!(data.contains_key("key.pem"));
    let annotations = secret.metadata.annotations.unwrap();
    assert_eq!(annotations.get("serviceAccountKeyName").unwrap(), "key-1");
    assert_eq!(
        annotations.get("reloader.stakater.com/match").unwrap(),
        "true"
    );

    // Vault got the json payload under the configured key.
    let paths = h.vault.paths.lock().unwrap();
    let map = paths.get("secret/dsde/my-service").unwrap();
    assert_eq!(map.get("sa-key").unwrap(), FAKE_MATERIAL);

    drop(paths);
    assert_write_ahead(&h, &identity);
}

#[tokio::test]
async fn test_rotation_due_retires_current_and_issues_replacement() {
    let h = harness(
        FakeKeyOps::with_existing(&["K1"]),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    seed_with_current(&h.cache, "K1", 31);
    let resources = vec![gcp_resource(30, 14, 3)];
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &resources, &cancel)
        .await
        .unwrap();

    let entry = h.cache.entry(&identity).unwrap();
    assert_eq!(entry.current_key.as_ref().unwrap().id, "key-1");
    assert!(entry.rotated_keys.contains_key("K1"));
    assert!(entry.disabled_keys.is_empty());

    // K1 is superseded but still enabled at the provider.
    assert!(h.keyops.exists_at_provider("K1"));
    assert!(!h.keyops.is_disabled_at_provider("K1"));

    // Sinks were resynced to the replacement key.
    let status = entry.sync_status.get("terra-dev/my-service").unwrap();
    assert_eq!(status.last_synced_key_id, "key-1");
    assert_write_ahead(&h, &identity);
}

#[tokio::test]
async fn test_rotation_not_due_is_untouched() {
    let h = harness(
        FakeKeyOps::with_existing(&["K1"]),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    seed_with_current(&h.cache, "K1", 29);
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &[gcp_resource(30, 14, 3)], &cancel)
        .await
        .unwrap();

    let entry = h.cache.entry(&identity).unwrap();
    assert_eq!(entry.current_key.as_ref().unwrap().id, "K1");
    assert_eq!(h.keyops.created_count(), 0);
}

#[tokio::test]
async fn test_disable_proceeds_when_last_auth_is_old() {
    let now = Utc::now();
    let h = harness(
        FakeKeyOps::with_existing(&["K1", "K2"]),
        FakeAuthMetrics::with("K1", now - Duration::days(10)),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    let mut entry = Entry::new(identity.clone());
    entry.current_key = Some(CurrentKey {
        id: "K2".to_string(),
        material: FAKE_MATERIAL.as_bytes().to_vec(),
        created_at: now,
    });
    entry
        .rotated_keys
        .insert("K1".to_string(), now - Duration::days(15));
    h.cache.seed(&entry);
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &[gcp_resource(30, 14, 3)], &cancel)
        .await
        .unwrap();

    let entry = h.cache.entry(&identity).unwrap();
    assert!(entry.rotated_keys.is_empty());
    assert!(entry.disabled_keys.contains_key("K1"));
    assert!(h.keyops.is_disabled_at_provider("K1"));
    assert_write_ahead(&h, &identity);
}

#[tokio::test]
async fn test_disable_blocked_by_recent_use() {
    let now = Utc::now();
    let h = harness(
        FakeKeyOps::with_existing(&["K1", "K2"]),
        FakeAuthMetrics::with("K1", now - Duration::days(1)),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    let mut entry = Entry::new(identity.clone());
    entry.current_key = Some(CurrentKey {
        id: "K2".to_string(),
        material: FAKE_MATERIAL.as_bytes().to_vec(),
        created_at: now,
    });
    entry
        .rotated_keys
        .insert("K1".to_string(), now - Duration::days(15));
    h.cache.seed(&entry);
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &[gcp_resource(30, 14, 3)], &cancel)
        .await
        .unwrap();

    let entry = h.cache.entry(&identity).unwrap();
    assert!(entry.rotated_keys.contains_key("K1"));
    assert!(entry.disabled_keys.is_empty());
    assert!(!h.keyops.is_disabled_at_provider("K1"));
}

#[tokio::test]
async fn test_unknown_last_auth_counts_as_safe() {
    let now = Utc::now();
    let h = harness(
        FakeKeyOps::with_existing(&["K1", "K2"]),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    let mut entry = Entry::new(identity.clone());
    entry.current_key = Some(CurrentKey {
        id: "K2".to_string(),
        material: FAKE_MATERIAL.as_bytes().to_vec(),
        created_at: now,
    });
    entry
        .rotated_keys
        .insert("K1".to_string(), now - Duration::days(15));
    h.cache.seed(&entry);
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &[gcp_resource(30, 14, 3)], &cancel)
        .await
        .unwrap();

    assert!(h.keyops.is_disabled_at_provider("K1"));
}

#[tokio::test]
async fn test_delete_due_removes_key_at_provider() {
    let now = Utc::now();
    let h = harness(
        FakeKeyOps::with_existing(&["K1", "K2"]),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    let mut entry = Entry::new(identity.clone());
    entry.current_key = Some(CurrentKey {
        id: "K2".to_string(),
        material: FAKE_MATERIAL.as_bytes().to_vec(),
        created_at: now,
    });
    entry
        .disabled_keys
        .insert("K1".to_string(), now - Duration::days(4));
    h.cache.seed(&entry);
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &[gcp_resource(30, 14, 3)], &cancel)
        .await
        .unwrap();

    let entry = h.cache.entry(&identity).unwrap();
    assert!(entry.disabled_keys.is_empty());
    assert!(!h.keyops.exists_at_provider("K1"));
    assert_eq!(
        h.keyops.deleted.lock().unwrap().clone(),
        vec!["K1".to_string()]
    );
}

#[tokio::test]
async fn test_threshold_disagreement_floors_the_minimum() {
    // rotateAfter 5 vs 90 aggregates to the floor of 7; a 6-day-old key
    // must not rotate.
    let h = harness(
        FakeKeyOps::with_existing(&["K1"]),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    seed_with_current(&h.cache, "K1", 6);
    let mut aggressive = gcp_resource(5, 14, 3);
    aggressive.name = "aggressive".to_string();
    let relaxed = gcp_resource(90, 14, 3);
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &[aggressive, relaxed], &cancel)
        .await
        .unwrap();

    let entry = h.cache.entry(&identity).unwrap();
    assert_eq!(entry.current_key.as_ref().unwrap().id, "K1");
    assert_eq!(h.keyops.created_count(), 0);
}

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let h = harness(
        FakeKeyOps::default(),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    let resources = vec![gcp_resource(30, 14, 3)];
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &resources, &cancel)
        .await
        .unwrap();
    let first = h.cache.entry(&identity).unwrap().to_bytes().unwrap();
    let applies_after_first = h.cluster.applied.lock().unwrap().len();

    h.reconciler
        .reconcile_identity(&identity, &resources, &cancel)
        .await
        .unwrap();
    let second = h.cache.entry(&identity).unwrap().to_bytes().unwrap();

    assert_eq!(h.keyops.created_count(), 1);
    assert_eq!(first, second);
    // The checksum gate skipped every sink.
    assert_eq!(h.cluster.applied.lock().unwrap().len(), applies_after_first);
}

#[tokio::test]
async fn test_orphaned_provider_key_is_adopted() {
    // A crash between provider create and cache save leaves a key the
    // cache has never seen. A key young enough to be Yale-issued is
    // adopted into the rotated container and a fresh key is issued.
    let now = Utc::now();
    let h = harness(
        FakeKeyOps::with_existing_at(&[("orphan-1", now - Duration::days(2))]),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &[gcp_resource(30, 14, 3)], &cancel)
        .await
        .unwrap();

    let entry = h.cache.entry(&identity).unwrap();
    assert!(entry.rotated_keys.contains_key("orphan-1"));
    assert_eq!(entry.current_key.as_ref().unwrap().id, "key-1");
    assert_write_ahead(&h, &identity);
}

#[tokio::test]
async fn test_orphan_adoption_takes_only_newest_within_rotate_window() {
    // Three untracked provider keys: one far older than the 30-day rotate
    // threshold and two inside it. Only the newest in-window key is
    // adopted; the others are never pulled into the lifecycle.
    let now = Utc::now();
    let h = harness(
        FakeKeyOps::with_existing_at(&[
            ("admin-key", now - Duration::days(400)),
            ("orphan-older", now - Duration::days(5)),
            ("orphan-newer", now - Duration::days(1)),
        ]),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &[gcp_resource(30, 14, 3)], &cancel)
        .await
        .unwrap();

    let entry = h.cache.entry(&identity).unwrap();
    assert!(entry.rotated_keys.contains_key("orphan-newer"));
    assert!(!entry.rotated_keys.contains_key("orphan-older"));
    assert!(!entry.rotated_keys.contains_key("admin-key"));
    assert_eq!(entry.current_key.as_ref().unwrap().id, "key-1");

    // The untouched keys are still enabled at the provider.
    assert!(h.keyops.exists_at_provider("admin-key"));
    assert!(!h.keyops.is_disabled_at_provider("admin-key"));
    assert!(h.keyops.exists_at_provider("orphan-older"));
}

#[tokio::test]
async fn test_stale_orphan_is_left_alone_and_fresh_key_issued() {
    // An untracked key older than the rotate window was not issued by
    // Yale's schedule: it stays out of the lifecycle entirely and a new
    // key is issued as for a fresh identity.
    let now = Utc::now();
    let h = harness(
        FakeKeyOps::with_existing_at(&[("admin-key", now - Duration::days(400))]),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &[gcp_resource(30, 14, 3)], &cancel)
        .await
        .unwrap();

    let entry = h.cache.entry(&identity).unwrap();
    assert_eq!(entry.all_key_ids(), vec!["key-1".to_string()]);
    assert_eq!(h.keyops.created_count(), 1);

    // The foreign key survives untouched across the whole pass.
    assert!(h.keyops.exists_at_provider("admin-key"));
    assert!(!h.keyops.is_disabled_at_provider("admin-key"));
    assert!(h.keyops.deleted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_azure_disable_is_time_gated_only() {
    let now = Utc::now();
    let identity = Identity::azure("tenant-1", "app-1");
    let h = harness(
        FakeKeyOps::with_existing(&["OLD", "CUR"]),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let mut entry = Entry::new(identity.clone());
    entry.current_key = Some(CurrentKey {
        id: "CUR".to_string(),
        material: b"client-secret-value".to_vec(),
        created_at: now,
    });
    entry
        .rotated_keys
        .insert("OLD".to_string(), now - Duration::days(15));
    h.cache.seed(&entry);

    let resource = ConsumerResource {
        kind: "AzureClientSecret".to_string(),
        api_version: "yale.terra.bio/v1beta1".to_string(),
        namespace: "terra-dev".to_string(),
        name: "my-app".to_string(),
        uid: Some("uid-2".to_string()),
        annotations: BTreeMap::new(),
        identity: identity.clone(),
        key_rotation: KeyRotation {
            rotate_after: 90,
            disable_after: 14,
            delete_after: 3,
            ignore_usage_metrics: true,
        },
        secret: Some(SecretSpec {
            name: "my-app-secret".to_string(),
            json_key_name: Some("client-secret".to_string()),
            pem_key_name: None,
        }),
        replications: Vec::new(),
    };
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &[resource], &cancel)
        .await
        .unwrap();

    let entry = h.cache.entry(&identity).unwrap();
    assert!(entry.disabled_keys.contains_key("OLD"));
    let secret = h.cluster.latest("terra-dev", "my-app-secret").unwrap();
    assert_eq!(
        secret.data.unwrap().get("client-secret").unwrap().0,
        b"client-secret-value"
    );
}

#[tokio::test]
async fn test_entry_without_resources_is_garbage_collected() {
    let h = harness(
        FakeKeyOps::default(),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    h.cache.seed(&Entry::new(identity.clone()));
    let cancel = CancellationToken::new();

    // run() discovers the stale entry through cache.list().
    let outcome = h.reconciler.run(HashMap::new(), &cancel).await.unwrap();
    assert!(outcome.succeeded());
    assert!(h.cache.entry(&identity).is_none());
}

#[tokio::test]
async fn test_stale_entry_keys_still_age_out_without_resources() {
    let now = Utc::now();
    let h = harness(
        FakeKeyOps::with_existing(&["K1"]),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    let mut entry = Entry::new(identity.clone());
    entry
        .disabled_keys
        .insert("K1".to_string(), now - Duration::days(10));
    h.cache.seed(&entry);
    let cancel = CancellationToken::new();

    let outcome = h.reconciler.run(HashMap::new(), &cancel).await.unwrap();
    assert!(outcome.succeeded());

    // The key aged out, then the emptied entry was collected.
    assert!(!h.keyops.exists_at_provider("K1"));
    assert!(h.cache.entry(&identity).is_none());
}

#[tokio::test]
async fn test_cancellation_surfaces_typed_error() {
    let h = harness(
        FakeKeyOps::default(),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .reconciler
        .reconcile_identity(&gcp_identity(), &[gcp_resource(30, 14, 3)], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn test_invalid_resource_fails_identity_without_provider_calls() {
    let h = harness(
        FakeKeyOps::default(),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let mut resource = gcp_resource(30, 14, 3);
    resource.secret = None;
    resource.replications = Vec::new();
    let cancel = CancellationToken::new();

    let err = h
        .reconciler
        .reconcile_identity(&gcp_identity(), &[resource], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(h.keyops.created_count(), 0);
}

#[tokio::test]
async fn test_gsm_and_github_replications_fan_out() {
    let h = harness(
        FakeKeyOps::default(),
        FakeAuthMetrics::default(),
        PassOptions::default(),
    );
    let identity = gcp_identity();
    let mut resource = gcp_resource(30, 14, 3);
    resource.replications = vec![
        Replication::GoogleSecretManager {
            project: "p".to_string(),
            secret: "my-sa-key".to_string(),
            format: Format::Base64,
        },
        Replication::GithubActions {
            repo: "broadinstitute/terra".to_string(),
            secret: "SA_KEY".to_string(),
            format: Format::Json,
        },
    ];
    let cancel = CancellationToken::new();

    h.reconciler
        .reconcile_identity(&identity, &[resource], &cancel)
        .await
        .unwrap();

    let gsm = h.gsm.versions.lock().unwrap();
    let versions = gsm.get(&("p".to_string(), "my-sa-key".to_string())).unwrap();
    assert_eq!(versions.len(), 1);

    let github = h.github.secrets.lock().unwrap();
    assert!(github.contains_key(&(
        "broadinstitute/terra".to_string(),
        "Actions/SA_KEY".to_string()
    )));
}
