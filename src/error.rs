//! # Error Taxonomy
//!
//! Typed errors shared by every Yale component. The reconciler keys its
//! control flow off these variants:
//!
//! - [`Error::NotFound`] drives create-vs-update decisions in the cache and
//!   the key-operations adapters
//! - [`Error::InvariantViolation`] aborts an identity without persisting
//! - [`Error::Cancelled`] propagates a shutdown signal upward
//! - everything else aborts the current identity but lets the pass continue
//!
//! Provider HTTP responses are classified once, at the adapter boundary, via
//! [`Error::from_http_status`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Transient network or API failure. The identity is retried on the next
    /// pass.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The caller lacks permission at the provider or the cluster. Usually
    /// requires operator intervention.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The requested object does not exist. Distinct from other errors so
    /// callers can branch on it.
    #[error("not found: {0}")]
    NotFound(String),

    /// Applying the mutation would corrupt the Entry. The identity is
    /// aborted and nothing is persisted.
    #[error("cache entry invariant violated: {0}")]
    InvariantViolation(String),

    /// A replication sink holds a different value than our checksum says it
    /// should. The sink is resynced on the next pass.
    #[error("sync conflict: {0}")]
    SyncConflict(String),

    /// Shutdown was requested while a step was in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// Bad flags or a malformed resource spec. Fatal for the process when it
    /// comes from flag parsing, fatal for the identity when it comes from a
    /// resource.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True if this error is the typed not-found signal.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Classify a provider HTTP status into the taxonomy.
    ///
    /// 404 maps to [`Error::NotFound`], 401/403 to
    /// [`Error::PermissionDenied`], everything else to
    /// [`Error::ProviderUnavailable`].
    #[must_use]
    pub fn from_http_status(status: reqwest::StatusCode, context: &str, body: &str) -> Self {
        let detail = format!("{context}: HTTP {}: {}", status.as_u16(), body.trim());
        match status.as_u16() {
            404 => Error::NotFound(detail),
            401 | 403 => Error::PermissionDenied(detail),
            _ => Error::ProviderUnavailable(detail),
        }
    }

    /// Classify a Kubernetes API error into the taxonomy.
    #[must_use]
    pub fn from_kube(err: &kube::Error, context: &str) -> Self {
        match err {
            kube::Error::Api(api_err) => match api_err.code {
                404 => Error::NotFound(format!("{context}: {}", api_err.message)),
                401 | 403 => Error::PermissionDenied(format!("{context}: {}", api_err.message)),
                _ => Error::ProviderUnavailable(format!("{context}: {}", api_err.message)),
            },
            other => Error::ProviderUnavailable(format!("{context}: {other}")),
        }
    }

    /// Classify a reqwest transport error (timeouts, DNS, broken
    /// connections) as provider unavailability.
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error, context: &str) -> Self {
        Error::ProviderUnavailable(format!("{context}: {err}"))
    }
}
