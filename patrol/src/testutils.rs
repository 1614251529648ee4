use crate::document::PrometheusConfig;
use crate::prometheus::{MetricsBackend, QueryError};
use crate::store::{ConfigRevision, ConfigStore, StoreError, VersionToken};
use crate::types::CardinalitySample;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub const SAMPLE_CONFIG: &str = r#"global:
  scrape_interval: 15s
  external_labels:
    cluster: prod-1
rule_files:
- /etc/prometheus/alerts.yaml
scrape_configs:
- job_name: api
  static_configs:
  - targets: ["api:9100"]
  metric_relabel_configs:
  - source_labels: [__name__]
    regex: go_gc_.*
    action: drop
- job_name: worker
  sample_limit: 5000
  static_configs:
  - targets: ["worker:9100"]
alerting:
  alertmanagers:
  - static_configs:
    - targets: ["alertmanager:9093"]
"#;

type Interference = Box<dyn FnOnce(&PrometheusConfig) -> PrometheusConfig + Send>;

struct Stored {
    data: Vec<u8>,
    version: u64,
    interference: Option<Interference>,
}

/// In-memory store with a monotonically increasing version, behaving like a
/// ConfigMap under concurrent writers.
pub struct MemoryStore {
    stored: Mutex<Stored>,
    fail_updates: AtomicU32,
    fail_reads: AtomicBool,
    gets: AtomicUsize,
    writes: AtomicUsize,
    conflicts: AtomicUsize,
}

impl MemoryStore {
    pub fn new(contents: &str) -> Self {
        MemoryStore {
            stored: Mutex::new(Stored {
                data: contents.as_bytes().to_vec(),
                version: 1,
                interference: None,
            }),
            fail_updates: AtomicU32::new(0),
            fail_reads: AtomicBool::new(false),
            gets: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            conflicts: AtomicUsize::new(0),
        }
    }

    pub fn data(&self) -> Vec<u8> {
        self.stored.lock().data.clone()
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }

    /// Another writer stores `mutate` applied to the current document right
    /// before the next update lands, making that update conflict.
    pub fn interfere_once<F>(&self, mutate: F)
    where
        F: FnOnce(&PrometheusConfig) -> PrometheusConfig + Send + 'static,
    {
        self.stored.lock().interference = Some(Box::new(mutate));
    }

    /// The next `n` updates fail with a server error without writing.
    pub fn fail_next_updates(&self, n: u32) {
        self.fail_updates.store(n, Ordering::SeqCst);
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    pub fn restore_reads(&self) {
        self.fail_reads.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self) -> Result<ConfigRevision, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        // Give concurrent writers a chance to interleave between read and write.
        tokio::task::yield_now().await;

        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "etcdserver: request timed out".into(),
            });
        }

        let stored = self.stored.lock();
        Ok(ConfigRevision {
            data: stored.data.clone(),
            version: VersionToken::new(stored.version.to_string()),
        })
    }

    async fn update(&self, data: Vec<u8>, version: &VersionToken) -> Result<(), StoreError> {
        let remaining = self.fail_updates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_updates.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Status {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "internal error".into(),
            });
        }

        let mut stored = self.stored.lock();

        if let Some(mutate) = stored.interference.take() {
            let current = PrometheusConfig::from_slice(&stored.data).unwrap();
            stored.data = mutate(&current).to_vec().unwrap();
            stored.version += 1;
        }

        if version.as_str() != stored.version.to_string() {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Conflict(
                "the object has been modified; please apply your changes to the latest version and try again".into(),
            ));
        }

        stored.data = data;
        stored.version += 1;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Answers cardinality queries from canned samples, keyed by label.
#[derive(Default)]
pub struct StaticBackend {
    samples: HashMap<String, Vec<CardinalitySample>>,
    failing: Vec<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_samples(mut self, label: &str, samples: Vec<CardinalitySample>) -> Self {
        self.samples.insert(label.to_string(), samples);
        self
    }

    pub fn with_failure(mut self, label: &str) -> Self {
        self.failing.push(label.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsBackend for StaticBackend {
    async fn top_cardinality(
        &self,
        _selector: &str,
        label: &str,
        top_n: usize,
    ) -> Result<Vec<CardinalitySample>, QueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.iter().any(|l| l == label) {
            return Err(QueryError::Api {
                error_type: "execution".into(),
                error: "query processing would load too many samples into memory".into(),
            });
        }

        Ok(self
            .samples
            .get(label)
            .map(|samples| samples.iter().take(top_n).cloned().collect())
            .unwrap_or_default())
    }
}
