//! The Prometheus configuration document as stored in the config store.
//!
//! Only the fields the patrol rewrites are typed. Everything else is carried
//! in flattened mappings so that a parse/serialize cycle preserves it.

use crate::types::RelabelRule;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

#[derive(thiserror::Error, Debug)]
pub enum DocumentError {
    #[error("could not parse configuration document: {0}")]
    Parse(serde_yaml::Error),
    #[error("could not serialize configuration document: {0}")]
    Serialize(serde_yaml::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_files: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scrape_configs: Vec<ScrapeConfig>,

    /// `global`, `alerting`, `remote_write` and anything else.
    #[serde(flatten)]
    pub extra_fields: Mapping,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Entries are kept as raw YAML so rules written by other tools keep
    /// every key they were written with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metric_relabel_configs: Vec<Value>,

    #[serde(flatten)]
    pub extra_fields: Mapping,
}

impl PrometheusConfig {
    /// An empty or whitespace-only document is an empty configuration.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(PrometheusConfig::default());
        }
        serde_yaml::from_slice(bytes).map_err(DocumentError::Parse)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, DocumentError> {
        serde_yaml::to_string(self)
            .map(String::into_bytes)
            .map_err(DocumentError::Serialize)
    }
}

impl ScrapeConfig {
    pub fn job_name(&self) -> Option<&str> {
        self.extra_fields.get("job_name").and_then(Value::as_str)
    }

    pub fn contains_rule(&self, rule: &RelabelRule) -> bool {
        self.metric_relabel_configs
            .iter()
            .any(|entry| relabel_entry_key(entry) == Some(rule.key()))
    }
}

/// `(regex, target_label)` of a raw relabel entry, if it has both as strings.
pub fn relabel_entry_key(entry: &Value) -> Option<(&str, &str)> {
    let regex = entry.get("regex")?.as_str()?;
    let target_label = entry.get("target_label")?.as_str()?;
    Some((regex, target_label))
}

impl From<&RelabelRule> for Value {
    fn from(rule: &RelabelRule) -> Self {
        let mut mapping = Mapping::new();
        mapping.insert(
            "source_labels".into(),
            Value::Sequence(
                rule.source_labels
                    .iter()
                    .map(|label| Value::from(label.as_str()))
                    .collect(),
            ),
        );
        mapping.insert("regex".into(), rule.regex.as_str().into());
        mapping.insert("target_label".into(), rule.target_label.as_str().into());
        mapping.insert("replacement".into(), rule.replacement.as_str().into());
        mapping.insert("action".into(), rule.action.as_str().into());
        Value::Mapping(mapping)
    }
}
