//! Metrics definitions for the patrol.

use shared::metrics_defs::{MetricDef, MetricType};

pub const PATROL_CYCLES: MetricDef = MetricDef {
    name: "patrol.cycles",
    metric_type: MetricType::Counter,
    description: "Number of completed patrol cycles, successful or not",
};

pub const PATROL_CYCLE_ERRORS: MetricDef = MetricDef {
    name: "patrol.cycle.errors",
    metric_type: MetricType::Counter,
    description: "Number of patrol cycles that failed. Tagged with stage.",
};

pub const PATROL_LAST_SUCCESS: MetricDef = MetricDef {
    name: "patrol.last_success_timestamp_seconds",
    metric_type: MetricType::Gauge,
    description: "Unix time of the last patrol cycle that completed without error",
};

pub const PATROL_CYCLE_DURATION: MetricDef = MetricDef {
    name: "patrol.cycle.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a patrol cycle in seconds",
};

pub const SCAN_SERIES_DETECTED: MetricDef = MetricDef {
    name: "scan.series.detected",
    metric_type: MetricType::Counter,
    description: "Number of high cardinality series reported by scans",
};

pub const SCAN_QUERY_FAILURES: MetricDef = MetricDef {
    name: "scan.query.failures",
    metric_type: MetricType::Counter,
    description: "Number of cardinality queries that failed or timed out",
};

pub const RECONCILE_WRITES: MetricDef = MetricDef {
    name: "reconcile.writes",
    metric_type: MetricType::Counter,
    description: "Number of configuration documents written to the config store",
};

pub const RECONCILE_CONFLICTS: MetricDef = MetricDef {
    name: "reconcile.conflicts",
    metric_type: MetricType::Counter,
    description: "Number of writes rejected because the document changed concurrently",
};

pub const RECONCILE_WRITE_FAILURES: MetricDef = MetricDef {
    name: "reconcile.write.failures",
    metric_type: MetricType::Counter,
    description: "Number of writes that failed for reasons other than a conflict",
};

pub const VERSION_DETAILS: MetricDef = MetricDef {
    name: "version.details",
    metric_type: MetricType::Gauge,
    description: "Static series carrying build and backend version metadata as labels",
};

pub const ALL_METRICS: &[MetricDef] = &[
    PATROL_CYCLES,
    PATROL_CYCLE_ERRORS,
    PATROL_LAST_SUCCESS,
    PATROL_CYCLE_DURATION,
    SCAN_SERIES_DETECTED,
    SCAN_QUERY_FAILURES,
    RECONCILE_WRITES,
    RECONCILE_CONFLICTS,
    RECONCILE_WRITE_FAILURES,
    VERSION_DETAILS,
];
