//! Lowers a query plan to SQL++ against the time-series collection.
//!
//! Label predicates are embedded before the UNNEST so filtering happens at
//! the earliest possible point; the time window is applied by the outer
//! SELECT. Plans that pass `should_batch()` collapse into one UNION ALL
//! statement per metric name.

use super::EvalContext;
use super::plan::{AggregationPlan, MatcherOp, QueryPlan, SeriesQuery};

const MAX_TS: i64 = i64::MAX;

pub struct SqlBuilder<'a> {
    plan: &'a QueryPlan,
    ctx: &'a EvalContext,
    keyspace: &'a str,
}

impl<'a> SqlBuilder<'a> {
    pub fn new(plan: &'a QueryPlan, ctx: &'a EvalContext, keyspace: &'a str) -> Self {
        Self {
            plan,
            ctx,
            keyspace,
        }
    }

    /// Generate the SQL++ statement(s) for the plan.
    pub fn build(&self) -> Vec<String> {
        if self.plan.should_batch() {
            self.build_batched()
        } else {
            self.plan
                .series
                .iter()
                .map(|sq| self.series_query(sq))
                .collect()
        }
    }

    /// One UNION ALL statement per metric name, wrapped with the
    /// aggregation projection when the plan groups by labels.
    fn build_batched(&self) -> Vec<String> {
        let mut metrics: Vec<&str> = Vec::new();
        for sq in &self.plan.series {
            if !metrics.contains(&sq.metric_name.as_str()) {
                metrics.push(&sq.metric_name);
            }
        }

        let mut queries = Vec::new();
        for metric in metrics {
            let parts: Vec<String> = self
                .plan
                .series
                .iter()
                .filter(|sq| sq.metric_name == metric)
                .map(|sq| self.series_query(sq))
                .collect();

            if parts.len() == 1 {
                queries.push(parts.into_iter().next().unwrap());
                continue;
            }

            let union = parts
                .iter()
                .map(|part| format!("({part})"))
                .collect::<Vec<_>>()
                .join(" UNION ALL ");

            match &self.plan.aggregation {
                Some(agg) if !agg.without => queries.push(wrap_with_aggregation(&union, agg)),
                _ => queries.push(union),
            }
        }
        queries
    }

    /// The full statement for one series: labels filtered before UNNEST,
    /// time window applied outside.
    fn series_query(&self, sq: &SeriesQuery) -> String {
        let part = self.metric_filter(sq);
        let (from_millis, to_millis) = self.time_window();
        format!(
            "SELECT d.time, d.`value`, d.labels FROM ({part}) AS d \
             WHERE d.time_millis >= {from_millis} AND d.time_millis <= {to_millis}"
        )
    }

    /// Inner query unnesting the timeseries array with every label
    /// condition embedded.
    fn metric_filter(&self, sq: &SeriesQuery) -> String {
        timeseries_part(self.keyspace, &sq.metric_name, &label_conditions(sq))
    }

    /// Range queries use `[start, end]`; instant queries a small window
    /// around the evaluation time.
    fn time_window(&self) -> (i64, i64) {
        if self.ctx.is_range {
            (
                self.ctx.start.timestamp_millis(),
                self.ctx.end.timestamp_millis(),
            )
        } else {
            let t = self.ctx.time.timestamp_millis();
            (t - 30_000, t + 1_000)
        }
    }
}

/// Label predicates for one series, the `job` predicate first. The snapshot
/// id is injected as a `job` equality only when the selector carries no
/// explicit `job` matcher.
fn label_conditions(sq: &SeriesQuery) -> String {
    let mut conditions = Vec::new();

    let has_job_matcher = sq.matchers.iter().any(|m| m.name == "job");
    if !has_job_matcher {
        if let Some(snapshot) = &sq.snapshot_id {
            conditions.push(format!(
                "d.labels.`job` = '{}'",
                escape_value(snapshot)
            ));
        }
    }

    for matcher in &sq.matchers {
        let label = escape_label(&matcher.name);
        let value = escape_value(&matcher.value);
        let condition = match matcher.op {
            MatcherOp::Equal => format!("d.labels.{label} = '{value}'"),
            MatcherOp::NotEqual => format!("d.labels.{label} != '{value}'"),
            MatcherOp::RegexMatch => format!("d.labels.{label} LIKE '{value}'"),
            MatcherOp::RegexNotMatch => format!("d.labels.{label} NOT LIKE '{value}'"),
        };
        conditions.push(condition);
    }

    conditions.join(" AND ")
}

/// `SELECT time, OP(value) AS value, <by-labels> ... GROUP BY <by-labels>,
/// time ORDER BY time` around a union of parts.
fn wrap_with_aggregation(inner: &str, agg: &AggregationPlan) -> String {
    let label_columns: Vec<String> = agg
        .grouping
        .iter()
        .map(|label| format!("subq.labels.{}", escape_label(label)))
        .collect();

    let select_labels = if label_columns.is_empty() {
        String::new()
    } else {
        format!(", {}", label_columns.join(", "))
    };

    let mut group_by = label_columns;
    group_by.push("time".to_string());

    format!(
        "SELECT time, {op}(value) AS value{select_labels} FROM ({inner}) AS subq \
         GROUP BY {group_by} ORDER BY time",
        op = agg.op.as_sql(),
        group_by = group_by.join(", "),
    )
}

/// Inner UNNEST query shared by the PromQL path and the raw metric
/// endpoints: label conditions apply before the timeseries array is
/// unnested.
pub fn timeseries_part(keyspace: &str, metric: &str, conditions: &str) -> String {
    let mut query = format!(
        "SELECT t._t AS time_millis, MILLIS_TO_STR(t._t) AS time, t._v0 AS `value`, \
         d.labels AS labels FROM {keyspace} AS d \
         UNNEST _timeseries(d, {{'ts_ranges':[0, {MAX_TS}]}}) AS t \
         WHERE d.metric_name = '{metric}'",
        metric = escape_value(metric),
    );
    if !conditions.is_empty() {
        query.push_str(" AND ");
        query.push_str(conditions);
    }
    query
}

/// Label keys are backtick-quoted.
pub fn escape_label(label: &str) -> String {
    format!("`{label}`")
}

/// Single quotes in values are escaped by doubling.
pub fn escape_value(value: &str) -> String {
    value.replace('\'', "''")
}
