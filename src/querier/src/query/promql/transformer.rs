//! Transforms SQL++ row streams into Prometheus wire shape.
//!
//! Rows are ingested into a tagged value type at the boundary; everything
//! past ingestion works on `(millis, f64)` samples and is formatted exactly
//! once when the response is assembled.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use super::EvalContext;
use super::plan::{AggregationOp, AggregationPlan, FunctionName, FunctionPlan, QueryPlan};

/// A scalar cell from a SQL++ row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Float(f64),
    Int(i64),
    Str(String),
    Null,
}

impl RowValue {
    fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Self::Str(s.clone()),
            _ => Self::Null,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Str(s) => s.parse::<f64>().ok(),
            Self::Null => None,
        }
    }
}

/// One ingested row: a time string, a typed value, and optional labels.
#[derive(Debug, Clone)]
pub struct QueryRow {
    pub time: String,
    pub value: RowValue,
    pub labels: Option<BTreeMap<String, String>>,
}

impl QueryRow {
    /// Ingest a raw SQL++ result row. Untyped access stops here.
    pub fn from_json(row: &Value) -> Self {
        let time = match row.get("time") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        let value = row.get("value").map(RowValue::from_json).unwrap_or(RowValue::Null);
        let labels = row.get("labels").and_then(Value::as_object).map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k.clone(), s.clone())),
                    Value::Number(n) => Some((k.clone(), n.to_string())),
                    Value::Bool(b) => Some((k.clone(), b.to_string())),
                    _ => None,
                })
                .collect()
        });
        Self {
            time,
            value,
            labels,
        }
    }
}

/// One output series in Prometheus wire shape: `values` for matrices,
/// `value` for vectors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromSeries {
    pub metric: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<(f64, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<(f64, String)>,
}

#[derive(Debug, Serialize)]
pub struct ResultData {
    #[serde(rename = "resultType")]
    pub result_type: String,
    pub result: Vec<PromSeries>,
}

#[derive(Debug, Serialize)]
pub struct PrometheusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResultData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "errorType", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl PrometheusResponse {
    pub fn success(result_type: &str, result: Vec<PromSeries>) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(ResultData {
                result_type: result_type.to_string(),
                result,
            }),
            error: None,
            error_type: None,
        }
    }

    pub fn error(message: &str, error_type: &str) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(message.to_string()),
            error_type: Some(error_type.to_string()),
        }
    }
}

/// Working representation: labels plus `(millis, value)` samples.
#[derive(Debug, Clone)]
struct RawSeries {
    labels: BTreeMap<String, String>,
    samples: Vec<(i64, f64)>,
}

/// Transform raw rows into the Prometheus response for the plan.
pub fn transform(rows: Vec<QueryRow>, plan: &QueryPlan, ctx: &EvalContext) -> PrometheusResponse {
    let result_type = if ctx.is_range { "matrix" } else { "vector" };

    let mut grouped: BTreeMap<String, RawSeries> = BTreeMap::new();
    for row in rows {
        let Some(ts) = parse_row_time(&row.time) else {
            continue;
        };
        let Some(value) = row.value.as_f64() else {
            continue;
        };

        let mut labels = row.labels.unwrap_or_default();
        if let Some(sq) = plan.series.first() {
            labels.insert("__name__".to_string(), sq.metric_name.clone());
        }

        grouped
            .entry(label_key(&labels))
            .or_insert_with(|| RawSeries {
                labels,
                samples: Vec::new(),
            })
            .samples
            .push((ts, value));
    }

    let mut series: Vec<RawSeries> = grouped.into_values().collect();
    for s in series.iter_mut() {
        s.samples.sort_by_key(|(ts, _)| *ts);
    }

    if let Some(function) = &plan.function {
        series = apply_function(series, function);
    }
    if let Some(aggregation) = &plan.aggregation {
        series = apply_aggregation(series, aggregation);
    }

    let result = series
        .into_iter()
        .filter(|s| !s.samples.is_empty())
        .map(|s| {
            if ctx.is_range {
                PromSeries {
                    metric: s.labels,
                    values: s
                        .samples
                        .iter()
                        .map(|(ts, v)| (*ts as f64 / 1000.0, format_value(*v)))
                        .collect(),
                    value: None,
                }
            } else {
                let value = s
                    .samples
                    .last()
                    .map(|(ts, v)| (*ts as f64 / 1000.0, format_value(*v)));
                PromSeries {
                    metric: s.labels,
                    values: Vec::new(),
                    value,
                }
            }
        })
        .collect();

    PrometheusResponse::success(result_type, result)
}

/// RFC 3339 first, then numeric epoch seconds; values over 1e10 are taken
/// as milliseconds.
fn parse_row_time(time: &str) -> Option<i64> {
    if let Ok(t) = chrono::DateTime::parse_from_rfc3339(time) {
        return Some(t.timestamp_millis());
    }
    let ts = time.parse::<f64>().ok()?;
    if ts > 1e10 {
        Some(ts as i64)
    } else {
        Some((ts * 1000.0) as i64)
    }
}

fn label_key(labels: &BTreeMap<String, String>) -> String {
    let parts: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{{{}}}", parts.join(","))
}

/// rate/irate divide successive differences by the elapsed seconds;
/// increase keeps the raw difference. The output sample sits at the later
/// timestamp; pairs with non-increasing time are dropped.
fn apply_function(series: Vec<RawSeries>, function: &FunctionPlan) -> Vec<RawSeries> {
    let per_second = matches!(function.name, FunctionName::Rate | FunctionName::Irate);

    series
        .into_iter()
        .filter_map(|s| {
            if s.samples.len() < 2 {
                return None;
            }
            let mut samples = Vec::with_capacity(s.samples.len() - 1);
            for pair in s.samples.windows(2) {
                let (t0, v0) = pair[0];
                let (t1, v1) = pair[1];
                if t1 <= t0 {
                    continue;
                }
                let delta = v1 - v0;
                let value = if per_second {
                    delta / ((t1 - t0) as f64 / 1000.0)
                } else {
                    delta
                };
                samples.push((t1, value));
            }
            if samples.is_empty() {
                return None;
            }
            Some(RawSeries {
                labels: s.labels,
                samples,
            })
        })
        .collect()
}

/// Group series by the aggregation key and combine values per timestamp;
/// output timestamps are the union across the group.
fn apply_aggregation(series: Vec<RawSeries>, aggregation: &AggregationPlan) -> Vec<RawSeries> {
    let mut groups: BTreeMap<String, (BTreeMap<String, String>, BTreeMap<i64, Vec<f64>>)> =
        BTreeMap::new();

    for s in series {
        let labels = aggregation_labels(&s.labels, aggregation);
        let (_, buckets) = groups
            .entry(label_key(&labels))
            .or_insert_with(|| (labels, BTreeMap::new()));
        for (ts, v) in s.samples {
            buckets.entry(ts).or_default().push(v);
        }
    }

    groups
        .into_values()
        .map(|(labels, buckets)| RawSeries {
            labels,
            samples: buckets
                .into_iter()
                .map(|(ts, values)| (ts, aggregate(&values, aggregation.op)))
                .collect(),
        })
        .collect()
}

/// The aggregation key: labels minus `__name__`, then reduced by the
/// grouping clause (`by` keeps the listed labels, `without` drops them).
fn aggregation_labels(
    labels: &BTreeMap<String, String>,
    aggregation: &AggregationPlan,
) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(k, _)| k.as_str() != "__name__")
        .filter(|(k, _)| {
            let listed = aggregation.grouping.iter().any(|g| g == k.as_str());
            if aggregation.without {
                !listed
            } else {
                listed
            }
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn aggregate(values: &[f64], op: AggregationOp) -> f64 {
    match op {
        AggregationOp::Sum => values.iter().sum(),
        AggregationOp::Avg => values.iter().sum::<f64>() / values.len() as f64,
        AggregationOp::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggregationOp::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregationOp::Count => values.len() as f64,
    }
}

/// Prometheus sample formatting: special floats spelled out, everything
/// else in minimal base-10.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{value}")
    }
}
