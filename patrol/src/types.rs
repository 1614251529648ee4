use serde::{Deserialize, Serialize};

/// One row of a cardinality query: how many distinct values `label_name`
/// currently takes within `metric_name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CardinalitySample {
    pub metric_name: String,
    pub label_name: String,
    pub distinct_values: u64,
}

/// A series whose label cardinality exceeded the configured threshold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HighCardinalitySeries {
    pub metric_name: String,
    pub label_name: String,
    pub observed_cardinality: u64,
}

impl HighCardinalitySeries {
    pub fn new<M, L>(metric_name: M, label_name: L, observed_cardinality: u64) -> Self
    where
        M: Into<String>,
        L: Into<String>,
    {
        HighCardinalitySeries {
            metric_name: metric_name.into(),
            label_name: label_name.into(),
            observed_cardinality,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelabelAction {
    Replace,
}

impl RelabelAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RelabelAction::Replace => "replace",
        }
    }
}

/// A Prometheus `metric_relabel_configs` entry, serialized with the
/// backend's own key names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelabelRule {
    pub source_labels: Vec<String>,
    pub regex: String,
    pub target_label: String,
    pub replacement: String,
    pub action: RelabelAction,
}

impl RelabelRule {
    /// Two rules with the same key silence the same label of the same metric.
    pub fn key(&self) -> (&str, &str) {
        (&self.regex, &self.target_label)
    }
}
