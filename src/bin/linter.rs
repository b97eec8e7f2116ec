//! # yale-linter
//!
//! Standalone manifest check: every Deployment/StatefulSet referencing a
//! Yale-produced Secret must carry a reloader annotation, so the workload
//! picks up rotated credentials. Run it against a rendered manifest tree
//! in CI.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use yale::linter::lint_manifests;

/// Verify that workloads consuming Yale-managed Secrets are annotated for
/// reload.
#[derive(Debug, Parser)]
#[command(name = "yale-linter", version)]
struct Cli {
    /// Root directory of YAML manifests to lint
    #[arg(default_value = ".")]
    path: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yale=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let findings = lint_manifests(&cli.path)?;
    if findings.is_empty() {
        println!("no problems found");
        return Ok(());
    }
    for finding in &findings {
        eprintln!("{finding}");
    }
    eprintln!(
        "\n{} workload(s) reference Yale secrets without a reloader annotation. \
         Add reloader.stakater.com/auto=true (or .../search=true, or list the secret in \
         secret.reloader.stakater.com/reload), or opt out with yale.terra.bio/linter-ignore.",
        findings.len()
    );
    std::process::exit(1);
}
