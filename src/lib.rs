//! # Yale
//!
//! Cluster-resident credential lifecycle controller. Operators declare,
//! via `GcpSaKey` and `AzureClientSecret` custom resources, that a cloud
//! identity should have an active credential mirrored into one or more
//! consumer locations. Yale issues those credentials, rotates them on a
//! schedule, disables superseded credentials once evidence shows they are
//! no longer in use, and deletes them after a further quarantine period.
//!
//! The crate is organized around the per-identity state machine:
//!
//! - [`cache`] — per-identity [`cache::Entry`] persisted as cluster Secrets
//! - [`cutoffs`] — aggregated rotate/disable/delete thresholds
//! - [`keyops`] — create/disable/delete at the credential provider
//! - [`authmetrics`] — "when was this key last used?" telemetry scans
//! - [`keysync`] — fan-out of the active credential to declared sinks
//! - [`reconciler`] — the orchestrator driving all of the above
//! - [`collector`] — reads and groups the consumer resources
//! - [`linter`] — standalone manifest check for reloader annotations

pub mod auth;
pub mod authmetrics;
pub mod cache;
pub mod cli;
pub mod collector;
pub mod crd;
pub mod cutoffs;
pub mod error;
pub mod identity;
pub mod keyops;
pub mod keysync;
pub mod linter;
pub mod reconciler;
pub mod slack;

pub use error::{Error, Result};
pub use identity::{Identity, Provider};
