//! # Key Operations
//!
//! Uniform contract over the two credential providers. Each provider is an
//! independent adapter speaking its REST surface directly; the reconciler
//! only ever sees this trait.
//!
//! Semantics:
//!
//! - `create` issues a new credential and never mutates existing ones; the
//!   material is returned exactly once
//! - `ensure_disabled` is idempotent; disabling an already-disabled key is
//!   a no-op
//! - `delete` treats "already gone" as success
//! - Azure application passwords cannot be disabled at the provider, so the
//!   Azure adapter's `ensure_disabled` is a logical no-op and `is_disabled`
//!   reports on bare existence; the reconciler compensates (see there)

use crate::error::Result;
use crate::identity::Identity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

mod azure;
mod gcp;

pub use azure::AzureKeyOps;
pub use gcp::GcpKeyOps;

/// Handle to one provider-side credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub identity: Identity,
    pub id: String,
}

/// A credential as observed when listing at the provider. Used by the
/// orphan-adoption sweep; no material is ever available on this path.
#[derive(Debug, Clone)]
pub struct ProviderKey {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub disabled: bool,
}

/// Provider adapter contract.
#[async_trait]
pub trait KeyOps: Send + Sync {
    /// Issue a new credential for `identity`. Returns the key handle and
    /// the raw material (private-key JSON for GCP, the client-secret string
    /// for Azure). The material is not retrievable again.
    async fn create(&self, identity: &Identity) -> Result<(Key, Vec<u8>)>;

    /// Current provider-side disabled state. For Azure, which has no
    /// disabled state, reports `true` iff the credential still exists.
    async fn is_disabled(&self, key: &Key) -> Result<bool>;

    /// Idempotent disable. No-op if already disabled.
    async fn ensure_disabled(&self, key: &Key) -> Result<()>;

    /// Remove the credential at the provider. Success if already gone.
    async fn delete(&self, key: &Key) -> Result<()>;

    /// List the credentials currently present for `identity`.
    async fn list(&self, identity: &Identity) -> Result<Vec<ProviderKey>>;
}
