//! Idempotent folds of patrol output into a configuration document.
//!
//! Both functions leave their input untouched and return the merged copy.
//! Applying either twice with the same arguments yields the same document as
//! applying it once.

use crate::document::PrometheusConfig;
use crate::types::RelabelRule;
use serde_yaml::Value;

/// Appends `path` to `rule_files` unless it is already referenced.
pub fn merge_rule_file(doc: &PrometheusConfig, path: &str) -> PrometheusConfig {
    let mut merged = doc.clone();
    if !merged.rule_files.iter().any(|existing| existing == path) {
        merged.rule_files.push(path.to_string());
    }
    merged
}

/// Adds each rule to every scrape config that has no entry with the same
/// `(regex, target_label)` pair yet.
pub fn merge_relabel_rules(doc: &PrometheusConfig, rules: &[RelabelRule]) -> PrometheusConfig {
    let mut merged = doc.clone();
    for scrape_config in &mut merged.scrape_configs {
        for rule in rules {
            if !scrape_config.contains_rule(rule) {
                scrape_config.metric_relabel_configs.push(Value::from(rule));
            }
        }
    }
    merged
}
