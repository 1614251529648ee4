use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("scan interval cannot be 0")]
    InvalidInterval,
    #[error("top_n cannot be 0")]
    InvalidTopN,
    #[error("threshold must be a finite, non-negative number")]
    InvalidThreshold,
    #[error("at least one tracked label is required")]
    NoTrackedLabels,
    #[error("empty tracked label name")]
    EmptyLabel,
    #[error("reconciler max_attempts cannot be 0")]
    InvalidMaxAttempts,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct MetricsBackend {
    pub url: Url,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct KubernetesStore {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub namespace: String,
    pub name: String,
    pub key: String,
    pub token_path: Option<PathBuf>,
    pub ca_cert_path: Option<PathBuf>,
}

fn default_api_url() -> String {
    "https://kubernetes.default.svc".into()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum ConfigStoreType {
    Kubernetes(KubernetesStore),
    Filesystem { path: PathBuf },
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Scan {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    pub tracked_labels: Vec<String>,
    #[serde(default = "default_metric_selector")]
    pub metric_selector: String,
}

fn default_interval_secs() -> u64 {
    15
}

fn default_top_n() -> usize {
    5
}

fn default_threshold() -> f64 {
    100.0
}

fn default_metric_selector() -> String {
    r#"{__name__=~".+"}"#.into()
}

impl Scan {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Upper bound for any single backend or store call. Kept well below the
    /// interval so a stalled dependency cannot hold a cycle across many ticks.
    pub fn call_timeout(&self) -> Duration {
        (self.interval() / 3).max(Duration::from_millis(100))
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Reconciler {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    2000
}

impl Default for Reconciler {
    fn default() -> Self {
        Reconciler {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Bootstrap {
    /// Static rule file shipped with the sidecar.
    pub source_rules: PathBuf,
    /// Where the backend reads it from, when it cannot read `source_rules` directly.
    pub install_path: Option<PathBuf>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub prometheus: MetricsBackend,
    pub config_store: ConfigStoreType,
    pub scan: Scan,
    #[serde(default)]
    pub reconciler: Reconciler,
    pub bootstrap: Option<Bootstrap>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.scan.interval_secs == 0 {
            return Err(ValidationError::InvalidInterval);
        }
        if self.scan.top_n == 0 {
            return Err(ValidationError::InvalidTopN);
        }
        if !self.scan.threshold.is_finite() || self.scan.threshold < 0.0 {
            return Err(ValidationError::InvalidThreshold);
        }
        if self.scan.tracked_labels.is_empty() {
            return Err(ValidationError::NoTrackedLabels);
        }
        if self.scan.tracked_labels.iter().any(|l| l.trim().is_empty()) {
            return Err(ValidationError::EmptyLabel);
        }
        if self.reconciler.max_attempts == 0 {
            return Err(ValidationError::InvalidMaxAttempts);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
prometheus:
    url: http://localhost:9090
config_store:
    type: filesystem
    path: /tmp/prometheus.yml
scan:
    tracked_labels: [user_id]
"#;

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.scan.interval_secs, 15);
        assert_eq!(config.scan.top_n, 5);
        assert_eq!(config.scan.threshold, 100.0);
        assert_eq!(config.scan.metric_selector, r#"{__name__=~".+"}"#);
        assert_eq!(config.reconciler, Reconciler::default());
        assert_eq!(config.reconciler.max_attempts, 5);
        assert_eq!(config.scan.call_timeout(), Duration::from_secs(5));
        assert!(config.bootstrap.is_none());
        assert_eq!(
            config.config_store,
            ConfigStoreType::Filesystem {
                path: "/tmp/prometheus.yml".into()
            }
        );
    }

    #[test]
    fn test_kubernetes_store() {
        let yaml = r#"
prometheus:
    url: http://prometheus.monitoring:9090
config_store:
    type: kubernetes
    namespace: monitoring
    name: prometheus
    key: prometheus.yml
    token_path: /var/run/secrets/kubernetes.io/serviceaccount/token
scan:
    interval_secs: 30
    top_n: 10
    threshold: 250
    tracked_labels: [user_id, session_id]
reconciler:
    max_attempts: 3
bootstrap:
    source_rules: /etc/squelch/rules.yaml
    install_path: /etc/config/squelch/rules.yaml
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());

        let ConfigStoreType::Kubernetes(store) = &config.config_store else {
            panic!("expected kubernetes store");
        };
        assert_eq!(store.api_url, "https://kubernetes.default.svc");
        assert_eq!(store.namespace, "monitoring");
        assert_eq!(store.ca_cert_path, None);
        assert_eq!(config.scan.threshold, 250.0);
        assert_eq!(config.reconciler.backoff_ms, 2000);
        assert_eq!(config.scan.call_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_validation_errors() {
        let base: Config = serde_yaml::from_str(MINIMAL).unwrap();

        let mut config = base.clone();
        config.scan.interval_secs = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidInterval));

        let mut config = base.clone();
        config.scan.top_n = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidTopN));

        let mut config = base.clone();
        config.scan.threshold = f64::NAN;
        assert_eq!(config.validate(), Err(ValidationError::InvalidThreshold));

        let mut config = base.clone();
        config.scan.threshold = -1.0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidThreshold));

        let mut config = base.clone();
        config.scan.tracked_labels.clear();
        assert_eq!(config.validate(), Err(ValidationError::NoTrackedLabels));

        let mut config = base.clone();
        config.scan.tracked_labels.push(" ".into());
        assert_eq!(config.validate(), Err(ValidationError::EmptyLabel));

        let mut config = base;
        config.reconciler.max_attempts = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidMaxAttempts));
    }

    #[test]
    fn test_deserialization_errors() {
        // Unknown store type
        assert!(
            serde_yaml::from_str::<ConfigStoreType>("{type: etcd, path: /x}").is_err()
        );

        // Invalid URL
        assert!(serde_yaml::from_str::<MetricsBackend>("{url: not-a-url}").is_err());

        // Missing tracked labels
        assert!(serde_yaml::from_str::<Scan>("{interval_secs: 5}").is_err());
    }
}
