use crate::config::Bootstrap;
use crate::merger::merge_rule_file;
use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum BootstrapError {
    #[error("could not read rule file {path}: {source}")]
    ReadRules { path: PathBuf, source: io::Error },
    #[error("{path} is not a valid rule file: {source}")]
    InvalidRules {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("could not install rule file to {path}: {source}")]
    InstallRules { path: PathBuf, source: io::Error },
    #[error("path {0} is not valid UTF-8")]
    NonUtf8Path(PathBuf),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

// Just enough structure to reject files the backend would refuse to load.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    groups: Vec<RuleGroup>,
}

#[derive(Deserialize)]
struct RuleGroup {
    #[allow(dead_code)]
    name: String,
    #[allow(dead_code)]
    rules: Vec<serde_yaml::Value>,
}

/// Installs the static rule file and references it from the configuration
/// document. Runs once before the patrol loop starts.
pub async fn install_rules(
    bootstrap: &Bootstrap,
    reconciler: &Reconciler,
) -> Result<ReconcileOutcome, BootstrapError> {
    let source = &bootstrap.source_rules;
    let rules = tokio::fs::read(source)
        .await
        .map_err(|e| BootstrapError::ReadRules {
            path: source.clone(),
            source: e,
        })?;

    serde_yaml::from_slice::<RuleFile>(&rules).map_err(|e| BootstrapError::InvalidRules {
        path: source.clone(),
        source: e,
    })?;

    let reference = match &bootstrap.install_path {
        Some(install_path) => {
            write_rules(install_path, &rules).await?;
            install_path
        }
        None => source,
    };

    let reference = reference
        .to_str()
        .ok_or_else(|| BootstrapError::NonUtf8Path(reference.clone()))?;

    let outcome = reconciler
        .reconcile(|doc| merge_rule_file(doc, reference))
        .await?;

    tracing::info!(rule_file = reference, ?outcome, "static rules installed");
    Ok(outcome)
}

async fn write_rules(path: &Path, rules: &[u8]) -> Result<(), BootstrapError> {
    let install_error = |e| BootstrapError::InstallRules {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(install_error)?;
    }
    tokio::fs::write(path, rules).await.map_err(install_error)
}
