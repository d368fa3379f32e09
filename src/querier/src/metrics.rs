//! Raw metric queries for the snapshot-scoped endpoints.
//!
//! These bound the time-series rows by the snapshot's (or one phase's)
//! recorded interval by joining the metadata document. A still-open
//! interval leaves the upper bound open.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::query::promql::sqlbuilder::{escape_label, escape_value, timeseries_part};

/// Which columns the caller needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    TimeAndValue,
    ValueOnly,
}

impl Projection {
    fn columns(&self) -> &'static str {
        match self {
            Self::TimeAndValue => "d.time, d.`value`",
            Self::ValueOnly => "d.`value`",
        }
    }
}

/// Equality conditions for the caller's label filters, with the `job`
/// predicate selecting the snapshot first.
fn label_conditions(snapshot_id: &str, filters: &BTreeMap<String, String>) -> String {
    let mut conditions = vec![format!("d.labels.`job` = '{}'", escape_value(snapshot_id))];
    for (name, value) in filters {
        conditions.push(format!(
            "d.labels.{} = '{}'",
            escape_label(name),
            escape_value(value)
        ));
    }
    conditions.join(" AND ")
}

/// Rows for one metric bounded by the snapshot's `[ts_start, ts_end]`.
pub fn snapshot_metric_query(
    ts_keyspace: &str,
    metadata_keyspace: &str,
    metric: &str,
    snapshot_id: &str,
    filters: &BTreeMap<String, String>,
    projection: Projection,
) -> String {
    let part = timeseries_part(ts_keyspace, metric, &label_conditions(snapshot_id, filters));
    format!(
        "SELECT {columns} FROM ({part}) AS d \
         JOIN {metadata_keyspace} AS s ON KEYS '{id}' \
         WHERE d.time_millis >= STR_TO_MILLIS(s.ts_start) \
         AND (s.ts_end IS MISSING OR d.time_millis <= STR_TO_MILLIS(s.ts_end))",
        columns = projection.columns(),
        id = escape_value(snapshot_id),
    )
}

/// Rows for one metric bounded by a named phase's interval.
pub fn phase_metric_query(
    ts_keyspace: &str,
    metadata_keyspace: &str,
    metric: &str,
    snapshot_id: &str,
    phase: &str,
    filters: &BTreeMap<String, String>,
    projection: Projection,
) -> String {
    let part = timeseries_part(ts_keyspace, metric, &label_conditions(snapshot_id, filters));
    format!(
        "SELECT {columns} FROM ({part}) AS d \
         JOIN {metadata_keyspace} AS s ON KEYS '{id}' \
         UNNEST s.phases AS p \
         WHERE p.label = '{phase}' \
         AND d.time_millis >= STR_TO_MILLIS(p.ts_start) \
         AND (p.ts_end IS MISSING OR d.time_millis <= STR_TO_MILLIS(p.ts_end))",
        columns = projection.columns(),
        id = escape_value(snapshot_id),
        phase = escape_value(phase),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDataPoint {
    pub time: String,
    pub value: f64,
}

/// Extract `{time, value}` points from result rows; rows missing either
/// field are skipped.
pub fn extract_points(rows: &[Value]) -> Vec<MetricDataPoint> {
    rows.iter()
        .filter_map(|row| {
            let time = row.get("time")?.as_str()?.to_string();
            let value = row.get("value")?.as_f64()?;
            Some(MetricDataPoint { time, value })
        })
        .collect()
}

/// Extract bare values for summary computation.
pub fn extract_values(rows: &[Value]) -> Vec<f64> {
    rows.iter()
        .filter_map(|row| row.get("value")?.as_f64())
        .collect()
}
