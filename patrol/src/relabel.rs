//! Turns a detected high-cardinality series into the relabel rule that
//! silences it.
//!
//! Rules are not scoped to the scrape job that produced the series, so a rule
//! silences the label on every job exposing the same metric name.

use crate::types::{HighCardinalitySeries, RelabelAction, RelabelRule};

/// Value written into the offending label once a rule applies.
pub const SILENCED_VALUE: &str = "squelched";

/// Prometheus joins `source_labels` with this separator unless configured otherwise.
const SOURCE_LABEL_SEPARATOR: &str = ";";

const METRIC_NAME_LABEL: &str = "__name__";

pub fn generate(series: &HighCardinalitySeries) -> RelabelRule {
    let regex = format!(
        "^{}{}.*$",
        regex::escape(&series.metric_name),
        SOURCE_LABEL_SEPARATOR
    );

    RelabelRule {
        source_labels: vec![METRIC_NAME_LABEL.to_string(), series.label_name.clone()],
        regex,
        target_label: series.label_name.clone(),
        replacement: SILENCED_VALUE.to_string(),
        action: RelabelAction::Replace,
    }
}
