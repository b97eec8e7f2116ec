//! Per-identity cache record.
//!
//! An [`Entry`] tracks the currently-active credential, rotated credentials
//! awaiting disablement, disabled credentials awaiting deletion, and the
//! per-resource sync bookkeeping. It is persisted as a versioned JSON
//! envelope inside a cluster Secret; see [`super::KubeCache`].
//!
//! The three key containers are pairwise disjoint at every observable
//! state. Mutating helpers uphold the invariant; [`Entry::check_invariants`]
//! re-verifies it before every save.

use crate::error::{Error, Result};
use crate::identity::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zeroize::Zeroize;

/// Envelope schema version. Bump on any incompatible change to [`Entry`].
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// The currently-active credential and its material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentKey {
    /// Provider-assigned key ID
    pub id: String,
    /// Raw credential material: private-key JSON for GCP, the client-secret
    /// string for Azure. Base64 in the serialized envelope.
    #[serde(with = "base64_bytes")]
    pub material: Vec<u8>,
    /// Issuance time at the provider
    pub created_at: DateTime<Utc>,
}

impl Drop for CurrentKey {
    fn drop(&mut self) {
        self.material.zeroize();
    }
}

/// Sync bookkeeping for one consumer resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub last_synced_key_id: String,
    pub last_synced_at: DateTime<Utc>,
    /// sha256 over the synced key ID and the resource's target descriptor
    pub checksum: String,
}

/// Persisted per-identity record. Sole authority on which credentials exist
/// for an identity and where they are in the lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub identity: Identity,
    #[serde(default)]
    pub current_key: Option<CurrentKey>,
    /// key ID → time the key lost "current" status
    #[serde(default)]
    pub rotated_keys: BTreeMap<String, DateTime<Utc>>,
    /// key ID → time the provider confirmed disablement
    #[serde(default)]
    pub disabled_keys: BTreeMap<String, DateTime<Utc>>,
    /// `namespace/name` of a consumer resource → last successful sync
    #[serde(default)]
    pub sync_status: BTreeMap<String, SyncStatus>,
}

/// Versioned on-disk wrapper around [`Entry`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    schema_version: u32,
    entry: Entry,
}

impl Entry {
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            current_key: None,
            rotated_keys: BTreeMap::new(),
            disabled_keys: BTreeMap::new(),
            sync_status: BTreeMap::new(),
        }
    }

    /// True when the Entry tracks no keys at all. Such Entries are eligible
    /// for garbage collection once no consumer resources remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current_key.is_none()
            && self.rotated_keys.is_empty()
            && self.disabled_keys.is_empty()
    }

    /// Every key ID the Entry tracks, in any container.
    #[must_use]
    pub fn all_key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .current_key
            .iter()
            .map(|k| k.id.clone())
            .chain(self.rotated_keys.keys().cloned())
            .chain(self.disabled_keys.keys().cloned())
            .collect();
        ids.sort();
        ids
    }

    /// Install a freshly-issued credential as the active key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if another key is already
    /// active or the ID is tracked elsewhere in the Entry.
    pub fn promote(
        &mut self,
        id: String,
        material: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(current) = &self.current_key {
            return Err(Error::InvariantViolation(format!(
                "{}: cannot promote key {id}: key {} is still current",
                self.identity, current.id
            )));
        }
        if self.rotated_keys.contains_key(&id) || self.disabled_keys.contains_key(&id) {
            return Err(Error::InvariantViolation(format!(
                "{}: cannot promote key {id}: already tracked as rotated or disabled",
                self.identity
            )));
        }
        self.current_key = Some(CurrentKey {
            id,
            material,
            created_at,
        });
        Ok(())
    }

    /// Move the active key into the rotated container.
    ///
    /// Returns the rotated key ID, or `None` if no key was active.
    pub fn rotate_current(&mut self, rotated_at: DateTime<Utc>) -> Option<String> {
        let current = self.current_key.take()?;
        self.rotated_keys.insert(current.id.clone(), rotated_at);
        Some(current.id.clone())
    }

    /// Move a rotated key into the disabled container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if the key is not in the
    /// rotated container or the timestamps would run backwards.
    pub fn mark_disabled(&mut self, key_id: &str, disabled_at: DateTime<Utc>) -> Result<()> {
        let Some(rotated_at) = self.rotated_keys.remove(key_id) else {
            return Err(Error::InvariantViolation(format!(
                "{}: cannot disable key {key_id}: not in rotated set",
                self.identity
            )));
        };
        if disabled_at < rotated_at {
            self.rotated_keys.insert(key_id.to_string(), rotated_at);
            return Err(Error::InvariantViolation(format!(
                "{}: key {key_id} disabled_at {disabled_at} precedes rotated_at {rotated_at}",
                self.identity
            )));
        }
        self.disabled_keys.insert(key_id.to_string(), disabled_at);
        Ok(())
    }

    /// Forget a key deleted at the provider.
    pub fn remove_deleted(&mut self, key_id: &str) {
        self.disabled_keys.remove(key_id);
    }

    /// Record a successful sync for one consumer resource.
    pub fn record_sync(&mut self, resource_key: String, status: SyncStatus) {
        self.sync_status.insert(resource_key, status);
    }

    /// Verify the structural invariants. Called before every save; a violation
    /// aborts the identity without persisting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] describing the first violation
    /// found.
    pub fn check_invariants(&self, now: DateTime<Utc>) -> Result<()> {
        if let Some(current) = &self.current_key {
            if current.created_at > now {
                return Err(Error::InvariantViolation(format!(
                    "{}: current key {} created_at {} is in the future",
                    self.identity, current.id, current.created_at
                )));
            }
            if self.rotated_keys.contains_key(&current.id)
                || self.disabled_keys.contains_key(&current.id)
            {
                return Err(Error::InvariantViolation(format!(
                    "{}: key {} is current and also rotated or disabled",
                    self.identity, current.id
                )));
            }
        }
        if let Some(id) = self
            .rotated_keys
            .keys()
            .find(|id| self.disabled_keys.contains_key(*id))
        {
            return Err(Error::InvariantViolation(format!(
                "{}: key {id} is both rotated and disabled",
                self.identity
            )));
        }
        Ok(())
    }

    /// Serialize into the versioned envelope stored in the cache Secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if the Entry cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let envelope = Envelope {
            schema_version: CACHE_SCHEMA_VERSION,
            entry: self.clone(),
        };
        serde_json::to_vec(&envelope).map_err(|e| {
            Error::InvariantViolation(format!("{}: cannot encode entry: {e}", self.identity))
        })
    }

    /// Deserialize from the versioned envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown schema version or a
    /// malformed payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| Error::Config(format!("malformed cache entry: {e}")))?;
        if envelope.schema_version != CACHE_SCHEMA_VERSION {
            return Err(Error::Config(format!(
                "unsupported cache schema version {} (expected {CACHE_SCHEMA_VERSION})",
                envelope.schema_version
            )));
        }
        Ok(envelope.entry)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry() -> Entry {
        Entry::new(Identity::gcp("p", "sa@p.iam.gserviceaccount.com"))
    }

    #[test]
    fn test_promote_then_rotate_moves_key() {
        let now = Utc::now();
        let mut e = entry();
        e.promote("k1".to_string(), b"material".to_vec(), now).unwrap();
        assert_eq!(e.current_key.as_ref().unwrap().id, "k1");

        let rotated = e.rotate_current(now).unwrap();
        assert_eq!(rotated, "k1");
        assert!(e.current_key.is_none());
        assert!(e.rotated_keys.contains_key("k1"));
        e.check_invariants(now).unwrap();
    }

    #[test]
    fn test_promote_rejects_second_current() {
        let now = Utc::now();
        let mut e = entry();
        e.promote("k1".to_string(), vec![], now).unwrap();
        let err = e.promote("k2".to_string(), vec![], now).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_promote_rejects_id_tracked_elsewhere() {
        let now = Utc::now();
        let mut e = entry();
        e.rotated_keys.insert("k1".to_string(), now);
        let err = e.promote("k1".to_string(), vec![], now).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_disable_requires_rotated_membership() {
        let now = Utc::now();
        let mut e = entry();
        let err = e.mark_disabled("ghost", now).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_disable_preserves_timestamp_ordering() {
        let now = Utc::now();
        let mut e = entry();
        e.rotated_keys.insert("k1".to_string(), now);
        let err = e.mark_disabled("k1", now - Duration::days(1)).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        // Rejected disable leaves the key where it was.
        assert!(e.rotated_keys.contains_key("k1"));
    }

    #[test]
    fn test_full_lifecycle_keeps_containers_disjoint() {
        let now = Utc::now();
        let mut e = entry();
        e.promote("k1".to_string(), b"m1".to_vec(), now - Duration::days(31))
            .unwrap();
        e.rotate_current(now).unwrap();
        e.promote("k2".to_string(), b"m2".to_vec(), now).unwrap();
        e.mark_disabled("k1", now).unwrap();
        e.check_invariants(now).unwrap();

        assert_eq!(e.all_key_ids(), vec!["k1".to_string(), "k2".to_string()]);
        e.remove_deleted("k1");
        assert_eq!(e.all_key_ids(), vec!["k2".to_string()]);
    }

    #[test]
    fn test_invariants_reject_future_created_at() {
        let now = Utc::now();
        let mut e = entry();
        e.promote("k1".to_string(), vec![], now + Duration::hours(2))
            .unwrap();
        assert!(e.check_invariants(now).is_err());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let now = Utc::now();
        let mut e = entry();
        e.promote("k1".to_string(), b"secret-material".to_vec(), now)
            .unwrap();
        e.record_sync(
            "ns/res".to_string(),
            SyncStatus {
                last_synced_key_id: "k1".to_string(),
                last_synced_at: now,
                checksum: "abc".to_string(),
            },
        );

        let bytes = e.to_bytes().unwrap();
        let restored = Entry::from_bytes(&bytes).unwrap();
        assert_eq!(restored.identity, e.identity);
        assert_eq!(restored.current_key.as_ref().unwrap().id, "k1");
        assert_eq!(
            restored.current_key.as_ref().unwrap().material,
            b"secret-material".to_vec()
        );
        assert_eq!(restored.sync_status.len(), 1);
    }

    #[test]
    fn test_envelope_rejects_unknown_schema_version() {
        let payload = serde_json::json!({
            "schemaVersion": 99,
            "entry": { "identity": { "provider": "gcp", "scope": "p", "name": "sa" } }
        });
        let err = Entry::from_bytes(payload.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
