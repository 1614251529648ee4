use crate::metrics_defs::{SCAN_QUERY_FAILURES, SCAN_SERIES_DETECTED};
use crate::prometheus::{MetricsBackend, QueryError};
use crate::types::HighCardinalitySeries;
use indexmap::IndexMap;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// A tracked label whose cardinality query did not complete.
#[derive(Debug)]
pub struct QueryFailure {
    pub label: String,
    pub error: QueryError,
}

/// Result of one scan. Successful queries contribute `series` even when
/// other queries failed.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub series: Vec<HighCardinalitySeries>,
    pub failures: Vec<QueryFailure>,
    pub queries: usize,
}

impl ScanReport {
    pub fn all_failed(&self) -> bool {
        self.queries > 0 && self.failures.len() == self.queries
    }
}

/// Finds metrics whose tracked labels take more distinct values than allowed.
pub struct CardinalityScanner {
    backend: Arc<dyn MetricsBackend>,
    tracked_labels: Vec<String>,
    selector: String,
    call_timeout: Duration,
}

impl CardinalityScanner {
    pub fn new(
        backend: Arc<dyn MetricsBackend>,
        tracked_labels: Vec<String>,
        selector: String,
        call_timeout: Duration,
    ) -> Self {
        CardinalityScanner {
            backend,
            tracked_labels,
            selector,
            call_timeout,
        }
    }

    /// Issues one query per tracked label. A series is reported when its
    /// distinct value count is strictly greater than `threshold`.
    pub async fn scan(&self, top_n: usize, threshold: f64) -> ScanReport {
        // Keyed by (metric, label) so a pair reported twice is kept once.
        let mut detected: IndexMap<(String, String), u64> = IndexMap::new();
        let mut failures = Vec::new();

        for label in &self.tracked_labels {
            let query = self.backend.top_cardinality(&self.selector, label, top_n);
            let samples = match timeout(self.call_timeout, query).await {
                Ok(Ok(samples)) => samples,
                Ok(Err(error)) => {
                    failures.push(QueryFailure {
                        label: label.clone(),
                        error,
                    });
                    continue;
                }
                Err(_) => {
                    failures.push(QueryFailure {
                        label: label.clone(),
                        error: QueryError::Timeout(self.call_timeout),
                    });
                    continue;
                }
            };

            for sample in samples {
                if sample.distinct_values as f64 <= threshold {
                    continue;
                }

                tracing::info!(
                    metric = %sample.metric_name,
                    label = %sample.label_name,
                    cardinality = sample.distinct_values,
                    "high cardinality series detected"
                );

                let count = detected
                    .entry((sample.metric_name, sample.label_name))
                    .or_insert(0);
                *count = (*count).max(sample.distinct_values);
            }
        }

        for failure in &failures {
            tracing::warn!(label = %failure.label, error = %failure.error, "cardinality query failed");
        }
        counter!(SCAN_QUERY_FAILURES).increment(failures.len() as u64);
        counter!(SCAN_SERIES_DETECTED).increment(detected.len() as u64);

        ScanReport {
            series: detected
                .into_iter()
                .map(|((metric_name, label_name), observed_cardinality)| HighCardinalitySeries {
                    metric_name,
                    label_name,
                    observed_cardinality,
                })
                .collect(),
            failures,
            queries: self.tracked_labels.len(),
        }
    }
}
