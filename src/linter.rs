//! # Manifest Linter
//!
//! Walks YAML manifests, collects the cluster-Secret names Yale produces
//! (from `GcpSaKey` and `AzureClientSecret` documents) and verifies that
//! every Deployment or StatefulSet referencing one of those Secrets
//! carries a reloader annotation, so the workload restarts when Yale
//! rotates the credential.
//!
//! Accepted annotations:
//! - `reloader.stakater.com/auto: "true"`
//! - `reloader.stakater.com/search: "true"`
//! - `secret.reloader.stakater.com/reload` listing the Secret name
//!
//! A workload annotated with `yale.terra.bio/linter-ignore` is skipped.

use anyhow::{Context, Result};
use serde::Deserialize as _;
use serde_yaml::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const RELOADER_AUTO: &str = "reloader.stakater.com/auto";
const RELOADER_SEARCH: &str = "reloader.stakater.com/search";
const RELOADER_RELOAD: &str = "secret.reloader.stakater.com/reload";
const LINTER_IGNORE: &str = "yale.terra.bio/linter-ignore";

/// One workload missing its reloader annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintFinding {
    pub file: PathBuf,
    pub workload: String,
    pub secret: String,
}

impl std::fmt::Display for LintFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} references Yale secret '{}' but has no reloader annotation",
            self.file.display(),
            self.workload,
            self.secret
        )
    }
}

/// Lint every `.yaml`/`.yml` under `root`.
///
/// # Errors
///
/// Fails on unreadable files; malformed YAML documents are skipped with a
/// debug log since manifest trees routinely hold templated files.
pub fn lint_manifests(root: &Path) -> Result<Vec<LintFinding>> {
    let mut documents: Vec<(PathBuf, Value)> = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(std::result::Result::ok) {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if !entry.file_type().is_file() || !is_yaml {
            continue;
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        for document in serde_yaml::Deserializer::from_str(&content) {
            match Value::deserialize(document) {
                Ok(value) => documents.push((path.to_path_buf(), value)),
                Err(e) => debug!("skipping unparseable document in {}: {e}", path.display()),
            }
        }
    }

    let yale_secrets = yale_secret_names(documents.iter().map(|(_, v)| v));
    let mut findings = Vec::new();
    for (path, document) in &documents {
        findings.extend(lint_workload(path, document, &yale_secrets));
    }
    Ok(findings)
}

/// Secret names produced by Yale consumer resources.
fn yale_secret_names<'a, I>(documents: I) -> BTreeSet<String>
where
    I: Iterator<Item = &'a Value>,
{
    let mut names = BTreeSet::new();
    for document in documents {
        let kind = document.get("kind").and_then(Value::as_str);
        if !matches!(kind, Some("GcpSaKey" | "AzureClientSecret")) {
            continue;
        }
        if let Some(name) = document
            .get("spec")
            .and_then(|s| s.get("secret"))
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
        {
            names.insert(name.to_string());
        }
    }
    names
}

/// Findings for one document, empty unless it is a workload referencing a
/// Yale secret without a reloader annotation.
fn lint_workload(path: &Path, document: &Value, yale_secrets: &BTreeSet<String>) -> Vec<LintFinding> {
    let kind = document.get("kind").and_then(Value::as_str);
    if !matches!(kind, Some("Deployment" | "StatefulSet")) {
        return Vec::new();
    }
    let name = document
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>");
    let workload = format!("{} {name}", kind.unwrap_or_default());

    let annotations = document
        .get("metadata")
        .and_then(|m| m.get("annotations"))
        .cloned()
        .unwrap_or(Value::Null);
    if annotations.get(LINTER_IGNORE).is_some() {
        return Vec::new();
    }

    let mut referenced = BTreeSet::new();
    collect_secret_references(document, &mut referenced);

    referenced
        .into_iter()
        .filter(|secret| yale_secrets.contains(secret))
        .filter(|secret| !has_reloader_annotation(&annotations, secret))
        .map(|secret| LintFinding {
            file: path.to_path_buf(),
            workload: workload.clone(),
            secret,
        })
        .collect()
}

fn annotation_str<'a>(annotations: &'a Value, key: &str) -> Option<&'a str> {
    annotations.get(key).and_then(Value::as_str)
}

fn has_reloader_annotation(annotations: &Value, secret: &str) -> bool {
    if annotation_str(annotations, RELOADER_AUTO) == Some("true")
        || annotation_str(annotations, RELOADER_SEARCH) == Some("true")
    {
        return true;
    }
    annotation_str(annotations, RELOADER_RELOAD)
        .is_some_and(|list| list.split(',').any(|item| item.trim() == secret))
}

/// Walk the document for `secretName:` fields and `secretKeyRef`/
/// `secretRef` name fields.
fn collect_secret_references(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Mapping(mapping) => {
            for (key, child) in mapping {
                let key = key.as_str().unwrap_or_default();
                match key {
                    "secretName" => {
                        if let Some(name) = child.as_str() {
                            out.insert(name.to_string());
                        }
                    }
                    "secretKeyRef" | "secretRef" => {
                        if let Some(name) = child.get("name").and_then(Value::as_str) {
                            out.insert(name.to_string());
                        }
                    }
                    _ => collect_secret_references(child, out),
                }
            }
        }
        Value::Sequence(items) => {
            for item in items {
                collect_secret_references(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    const GSK: &str = r"
apiVersion: yale.terra.bio/v1beta1
kind: GcpSaKey
metadata:
  name: my-gsk
spec:
  secret:
    name: my-sa-secret
";

    fn deployment(annotations: &str) -> String {
        format!(
            r"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: my-app
{annotations}
spec:
  template:
    spec:
      containers:
        - name: app
          env:
            - name: KEY
              valueFrom:
                secretKeyRef:
                  name: my-sa-secret
                  key: key.json
"
        )
    }

    #[test]
    fn test_collects_yale_secret_names() {
        let names = yale_secret_names([parse(GSK)].iter());
        assert!(names.contains("my-sa-secret"));
    }

    #[test]
    fn test_flags_workload_without_annotation() {
        let names = yale_secret_names([parse(GSK)].iter());
        let findings = lint_workload(Path::new("d.yaml"), &parse(&deployment("")), &names);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].secret, "my-sa-secret");
        assert_eq!(findings[0].workload, "Deployment my-app");
    }

    #[test]
    fn test_accepts_auto_annotation() {
        let names = yale_secret_names([parse(GSK)].iter());
        let doc = deployment("  annotations:\n    reloader.stakater.com/auto: \"true\"");
        let findings = lint_workload(Path::new("d.yaml"), &parse(&doc), &names);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_accepts_reload_list_naming_the_secret() {
        let names = yale_secret_names([parse(GSK)].iter());
        let doc = deployment(
            "  annotations:\n    secret.reloader.stakater.com/reload: \"other,my-sa-secret\"",
        );
        let findings = lint_workload(Path::new("d.yaml"), &parse(&doc), &names);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_reload_list_missing_the_secret_is_flagged() {
        let names = yale_secret_names([parse(GSK)].iter());
        let doc =
            deployment("  annotations:\n    secret.reloader.stakater.com/reload: \"other\"");
        let findings = lint_workload(Path::new("d.yaml"), &parse(&doc), &names);
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_linter_ignore_suppresses_finding() {
        let names = yale_secret_names([parse(GSK)].iter());
        let doc = deployment("  annotations:\n    yale.terra.bio/linter-ignore: \"true\"");
        let findings = lint_workload(Path::new("d.yaml"), &parse(&doc), &names);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_non_yale_secret_reference_is_not_flagged() {
        let names = yale_secret_names([parse(GSK)].iter());
        let doc = parse(
            r"
kind: Deployment
metadata:
  name: other-app
spec:
  template:
    spec:
      volumes:
        - name: v
          secret:
            secretName: unrelated-secret
",
        );
        let findings = lint_workload(Path::new("d.yaml"), &doc, &names);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_collects_volume_and_envfrom_references() {
        let doc = parse(
            r"
kind: Deployment
metadata:
  name: app
spec:
  template:
    spec:
      containers:
        - name: app
          envFrom:
            - secretRef:
                name: from-envfrom
      volumes:
        - name: v
          secret:
            secretName: from-volume
",
        );
        let mut refs = BTreeSet::new();
        collect_secret_references(&doc, &mut refs);
        assert!(refs.contains("from-envfrom"));
        assert!(refs.contains("from-volume"));
    }

    #[test]
    fn test_lint_manifests_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gsk.yaml"), GSK).unwrap();
        std::fs::write(dir.path().join("deploy.yaml"), deployment("")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not yaml").unwrap();

        let findings = lint_manifests(dir.path()).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].workload, "Deployment my-app");
    }

    #[test]
    fn test_multi_document_files_are_split() {
        let dir = tempfile::tempdir().unwrap();
        let combined = format!("{GSK}---\n{}", deployment(""));
        std::fs::write(dir.path().join("all.yaml"), combined).unwrap();

        let findings = lint_manifests(dir.path()).unwrap();
        assert_eq!(findings.len(), 1);
    }
}
