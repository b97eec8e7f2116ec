//! # Yale
//!
//! One-shot reconciler binary. A single invocation:
//!
//! 1. Collects every `GcpSaKey` and `AzureClientSecret` in the cluster
//! 2. Reconciles each identity's credential lifecycle (rotate, sync,
//!    disable, delete)
//! 3. Exits 0 on overall success, non-zero when any identity failed
//!
//! Deployed as a CronJob; Yale assumes an external reloader operator
//! restarts workloads when the Secrets it writes change.

use anyhow::{Context, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use yale::authmetrics::GcpAuthMetrics;
use yale::cache::KubeCache;
use yale::cli::Cli;
use yale::collector;
use yale::crd::Replication;
use yale::identity::Provider;
use yale::keyops::{AzureKeyOps, GcpKeyOps, KeyOps};
use yale::keysync::{GithubRest, GsmRest, KubeClusterSecrets, Replicator, VaultKv};
use yale::reconciler::{PassOptions, Reconciler};
use yale::slack::SlackNotifier;

/// Default per-request deadline for provider calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing() {
    let default_level = if std::env::var("YALE_DEBUG_ENABLED").as_deref() == Ok("true") {
        "yale=debug"
    } else {
        "yale=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();
}

async fn kube_client(cli: &Cli) -> Result<Client> {
    if cli.local {
        let kubeconfig = match &cli.kubeconfig {
            Some(path) => Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig from {path}"))?,
            None => Kubeconfig::read().context("reading default kubeconfig")?,
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("building client config from kubeconfig")?;
        Client::try_from(config).context("building Kubernetes client")
    } else {
        Client::try_default()
            .await
            .context("building in-cluster Kubernetes client")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let rotate_window = cli.rotate_window()?;

    info!(
        "starting yale {} (build {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_HASH")
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        warn!("shutdown signal received; cancelling in-flight work");
        signal_cancel.cancel();
    });

    let client = kube_client(&cli).await?;
    let groups = collector::collect(&client).await?;

    // One Google token serves IAM, Monitoring and GSM. It is needed for any
    // GCP identity and for GSM replications declared on any identity.
    let needs_google = groups.keys().any(|id| id.provider == Provider::Gcp)
        || groups.values().flatten().any(|r| {
            r.replications
                .iter()
                .any(|rep| matches!(rep, Replication::GoogleSecretManager { .. }))
        });
    let google_token = if needs_google {
        match yale::auth::google_access_token(cli.local).await {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("no Google access token: {e}; GCP identities will fail this pass");
                None
            }
        }
    } else {
        None
    };

    let gcp_keyops: Option<Arc<dyn KeyOps>> = match google_token.clone() {
        Some(token) => Some(Arc::new(GcpKeyOps::new(token, REQUEST_TIMEOUT)?)),
        None => None,
    };
    let azure_keyops: Option<Arc<dyn KeyOps>> =
        Some(Arc::new(AzureKeyOps::new(REQUEST_TIMEOUT)?));
    let gcp_metrics = Arc::new(GcpAuthMetrics::new(
        google_token.clone().unwrap_or_default(),
        REQUEST_TIMEOUT,
    )?);

    let keysync = Arc::new(Replicator::new(
        Arc::new(KubeClusterSecrets::new(client.clone())),
        Arc::new(VaultKv::from_env()),
        Arc::new(GsmRest::new(google_token, REQUEST_TIMEOUT)?),
        Arc::new(GithubRest::from_env(REQUEST_TIMEOUT)?),
    ));
    let cache = Arc::new(KubeCache::new(client, cli.cache_namespace.clone()));

    let reconciler = Reconciler::new(
        cache,
        keysync,
        gcp_keyops,
        azure_keyops,
        gcp_metrics,
        SlackNotifier::from_env(),
        PassOptions {
            check_in_use: cli.check_in_use,
            rotate_window,
            concurrency: 8,
        },
    );

    let outcome = reconciler.run(groups, &cancel).await?;
    if outcome.succeeded() {
        info!("pass complete: {} identities reconciled", outcome.identities);
        Ok(())
    } else {
        for (identity, err) in &outcome.failures {
            error!("{identity}: {err}");
        }
        error!(
            "pass finished with {} of {} identities failed",
            outcome.failures.len(),
            outcome.identities
        );
        std::process::exit(1);
    }
}
