pub mod bootstrap;
pub mod config;
pub mod document;
pub mod kubernetes;
pub mod merger;
pub mod metrics_defs;
pub mod patrol;
pub mod prometheus;
pub mod reconciler;
pub mod relabel;
pub mod scanner;
pub mod store;
pub mod types;

#[cfg(test)]
mod testutils;

use crate::config::{Config, ConfigStoreType};
use crate::kubernetes::ConfigMapStore;
use crate::patrol::Patrol;
use crate::prometheus::{MetricsBackend, PrometheusClient, QueryError};
use crate::reconciler::Reconciler;
use crate::scanner::CardinalityScanner;
use crate::store::{ConfigStore, FilesystemStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("invalid configuration: {0}")]
    Validation(#[from] config::ValidationError),
    #[error("could not set up config store: {0}")]
    Store(#[from] StoreError),
    #[error("could not set up metrics backend client: {0}")]
    Backend(#[from] QueryError),
}

pub fn get_store(
    store_type: &ConfigStoreType,
    timeout: Duration,
) -> Result<Arc<dyn ConfigStore>, StoreError> {
    match store_type {
        ConfigStoreType::Kubernetes(k8s) => Ok(Arc::new(ConfigMapStore::new(k8s, timeout)?)),
        ConfigStoreType::Filesystem { path } => Ok(Arc::new(FilesystemStore::new(path.clone()))),
    }
}

pub fn get_backend(
    config: &config::MetricsBackend,
    timeout: Duration,
) -> Result<Arc<dyn MetricsBackend>, QueryError> {
    Ok(Arc::new(PrometheusClient::new(&config.url, timeout)?))
}

/// Everything the sidecar runs, built from a validated configuration.
pub struct Components {
    pub patrol: Patrol,
    /// Separate from the patrol's own reconciler so bootstrap can run first.
    pub bootstrap_reconciler: Reconciler,
}

pub fn build(config: &Config) -> Result<Components, SetupError> {
    config.validate()?;

    let call_timeout = config.scan.call_timeout();
    let store = get_store(&config.config_store, call_timeout)?;
    let backend = get_backend(&config.prometheus, call_timeout)?;

    let reconciler = |store: Arc<dyn ConfigStore>| {
        Reconciler::new(
            store,
            config.reconciler.max_attempts,
            Duration::from_millis(config.reconciler.backoff_ms),
            call_timeout,
        )
    };

    let scanner = CardinalityScanner::new(
        backend,
        config.scan.tracked_labels.clone(),
        config.scan.metric_selector.clone(),
        call_timeout,
    );

    Ok(Components {
        patrol: Patrol::new(
            scanner,
            reconciler(store.clone()),
            config.scan.top_n,
            config.scan.threshold,
            config.scan.interval(),
        ),
        bootstrap_reconciler: reconciler(store),
    })
}
