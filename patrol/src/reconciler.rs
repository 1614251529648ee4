use crate::document::{DocumentError, PrometheusConfig};
use crate::metrics_defs::{RECONCILE_CONFLICTS, RECONCILE_WRITE_FAILURES, RECONCILE_WRITES};
use crate::store::{ConfigRevision, ConfigStore, StoreError, VersionToken};
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The stored document already satisfied the mutation; nothing was written.
    Unchanged,
    /// The mutated document was stored on the given attempt.
    Written { attempts: u32 },
}

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("could not read configuration: {0}")]
    Read(StoreError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("giving up after {attempts} write attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: StoreError,
    },
}

/// Read-modify-write of the configuration document under optimistic concurrency.
pub struct Reconciler {
    store: Arc<dyn ConfigStore>,
    max_attempts: u32,
    backoff: Duration,
    call_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        max_attempts: u32,
        backoff: Duration,
        call_timeout: Duration,
    ) -> Self {
        Reconciler {
            store,
            max_attempts: max_attempts.max(1),
            backoff,
            call_timeout,
        }
    }

    /// Applies `mutate` to the current document and writes the result back.
    ///
    /// Every attempt fetches a fresh revision and applies `mutate` to it, so a
    /// retry after a conflict builds on whatever the other writer stored
    /// instead of resending a stale candidate.
    pub async fn reconcile<F>(&self, mutate: F) -> Result<ReconcileOutcome, ReconcileError>
    where
        F: Fn(&PrometheusConfig) -> PrometheusConfig,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let revision = self.get().await.map_err(ReconcileError::Read)?;
            let current = PrometheusConfig::from_slice(&revision.data)?;
            let candidate = mutate(&current);

            if candidate == current {
                tracing::debug!(version = %revision.version, "configuration already up to date");
                return Ok(ReconcileOutcome::Unchanged);
            }

            let data = candidate.to_vec()?;
            let error = match self.update(data, &revision.version).await {
                Ok(()) => {
                    counter!(RECONCILE_WRITES).increment(1);
                    tracing::info!(attempts, "configuration updated");
                    return Ok(ReconcileOutcome::Written { attempts });
                }
                Err(error) => error,
            };

            if error.is_conflict() {
                counter!(RECONCILE_CONFLICTS).increment(1);
                tracing::info!(attempts, %error, "configuration changed underneath us, retrying");
            } else {
                counter!(RECONCILE_WRITE_FAILURES).increment(1);
                tracing::warn!(attempts, %error, "configuration update failed");
            }

            if attempts >= self.max_attempts {
                return Err(ReconcileError::RetriesExhausted {
                    attempts,
                    last_error: error,
                });
            }

            sleep(self.backoff).await;
        }
    }

    async fn get(&self) -> Result<ConfigRevision, StoreError> {
        timeout(self.call_timeout, self.store.get())
            .await
            .map_err(|_| StoreError::Timeout(self.call_timeout))?
    }

    async fn update(&self, data: Vec<u8>, version: &VersionToken) -> Result<(), StoreError> {
        timeout(self.call_timeout, self.store.update(data, version))
            .await
            .map_err(|_| StoreError::Timeout(self.call_timeout))?
    }
}
