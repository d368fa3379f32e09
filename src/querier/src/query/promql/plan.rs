//! Query planner: reduces a PromQL AST to the set of series selections, the
//! aggregation, and the range function the SQL++ builder and the result
//! transformer work from.

use std::fmt;
use std::time::Duration;

use promql_parser::label::MatchOp;
use promql_parser::parser::token::{self, TokenType};
use promql_parser::parser::{Expr, LabelModifier, VectorSelector};

use super::error::PromQLError;
use super::parser;

/// Label matcher operators, Prometheus semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherOp {
    Equal,
    NotEqual,
    RegexMatch,
    RegexNotMatch,
}

impl fmt::Display for MatcherOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal => write!(f, "="),
            Self::NotEqual => write!(f, "!="),
            Self::RegexMatch => write!(f, "=~"),
            Self::RegexNotMatch => write!(f, "!~"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatcherOp,
    pub value: String,
}

/// One series selection against the time-series collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesQuery {
    pub metric_name: String,
    /// From a `job=` matcher when present, else the evaluation context.
    pub snapshot_id: Option<String>,
    pub matchers: Vec<LabelMatcher>,
}

/// The five supported aggregation operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggregationOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Count => "COUNT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationPlan {
    pub op: AggregationOp,
    pub grouping: Vec<String>,
    /// True for `without (...)`: grouping labels are excluded instead of
    /// kept.
    pub without: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionName {
    Rate,
    Irate,
    Increase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionPlan {
    pub name: FunctionName,
    pub range: Duration,
}

#[derive(Debug, Default)]
pub struct QueryPlan {
    pub series: Vec<SeriesQuery>,
    pub aggregation: Option<AggregationPlan>,
    pub function: Option<FunctionPlan>,
}

impl QueryPlan {
    /// Batch into one UNION ALL statement when every selector targets the
    /// same metric and the selector count is in `[5, 20]`.
    pub fn should_batch(&self) -> bool {
        if self.series.len() < 5 || self.series.len() > 20 {
            return false;
        }
        let first = &self.series[0].metric_name;
        self.series.iter().all(|sq| &sq.metric_name == first)
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "series: {}", self.series.len())?;
        if let Some(agg) = &self.aggregation {
            write!(f, ", aggregation: {}", agg.op.as_sql())?;
        }
        if let Some(func) = &self.function {
            write!(f, ", function: {:?}", func.name)?;
        }
        Ok(())
    }
}

/// Build a query plan from a parsed expression. `snapshot_id` is the
/// evaluation context's snapshot, used for selectors without a `job`
/// matcher.
pub fn plan(expr: &Expr, snapshot_id: Option<&str>) -> Result<QueryPlan, PromQLError> {
    let mut plan = QueryPlan::default();
    walk(expr, snapshot_id, &mut plan)?;
    if plan.series.is_empty() {
        return Err(PromQLError::UnsupportedFeature(
            "query selects no series".to_string(),
        ));
    }
    Ok(plan)
}

fn walk(expr: &Expr, snapshot_id: Option<&str>, plan: &mut QueryPlan) -> Result<(), PromQLError> {
    match expr {
        Expr::VectorSelector(vs) => {
            plan.series.push(series_query(vs, snapshot_id)?);
            Ok(())
        }
        Expr::MatrixSelector(ms) => {
            plan.series.push(series_query(&ms.vs, snapshot_id)?);
            Ok(())
        }
        Expr::Paren(paren) => walk(&paren.expr, snapshot_id, plan),
        Expr::Aggregate(agg) => {
            let op = aggregation_op(&agg.op)?;
            let (grouping, without) = match &agg.modifier {
                Some(LabelModifier::Include(labels)) => (labels.labels.clone(), false),
                Some(LabelModifier::Exclude(labels)) => (labels.labels.clone(), true),
                None => (Vec::new(), false),
            };
            plan.aggregation = Some(AggregationPlan {
                op,
                grouping,
                without,
            });
            walk(&agg.expr, snapshot_id, plan)
        }
        Expr::Call(call) => {
            let name = function_name(call.func.name)?;
            // the outermost call wins; its range comes from the matrix
            // selector argument
            if plan.function.is_none() {
                let range = call
                    .args
                    .args
                    .iter()
                    .find_map(|arg| range_of(arg))
                    .ok_or_else(|| {
                        PromQLError::UnsupportedFeature(format!(
                            "{} requires a range vector argument",
                            call.func.name
                        ))
                    })?;
                plan.function = Some(FunctionPlan { name, range });
            }
            for arg in call.args.args.iter() {
                walk(arg, snapshot_id, plan)?;
            }
            Ok(())
        }
        Expr::Binary(bin) => {
            // series from both sides are collected; the result is their
            // union
            walk(&bin.lhs, snapshot_id, plan)?;
            walk(&bin.rhs, snapshot_id, plan)
        }
        Expr::Unary(_) => Err(PromQLError::UnsupportedFeature(
            "unary expressions are not supported".to_string(),
        )),
        Expr::Subquery(_) => Err(PromQLError::UnsupportedFeature(
            "subqueries are not supported".to_string(),
        )),
        Expr::NumberLiteral(_) | Expr::StringLiteral(_) => Err(PromQLError::UnsupportedFeature(
            "standalone literals are not supported".to_string(),
        )),
        Expr::Extension(_) => Err(PromQLError::UnsupportedFeature(
            "extension expressions are not supported".to_string(),
        )),
    }
}

fn range_of(expr: &Expr) -> Option<Duration> {
    match expr {
        Expr::MatrixSelector(ms) => Some(ms.range),
        Expr::Paren(paren) => range_of(&paren.expr),
        _ => None,
    }
}

fn series_query(
    vs: &VectorSelector,
    ctx_snapshot: Option<&str>,
) -> Result<SeriesQuery, PromQLError> {
    let metric_name = parser::metric_name(vs)
        .ok_or_else(|| {
            PromQLError::UnsupportedFeature("vector selector without a metric name".to_string())
        })?
        .to_string();

    let mut snapshot_id = None;
    let mut matchers = Vec::new();
    for matcher in vs.matchers.matchers.iter() {
        if matcher.name == "__name__" {
            continue;
        }
        // an equality matcher on `job` selects the snapshot; the builder
        // re-injects it as the single job predicate
        if matcher.name == "job" && matches!(matcher.op, MatchOp::Equal) {
            snapshot_id = Some(matcher.value.clone());
            continue;
        }
        let op = match &matcher.op {
            MatchOp::Equal => MatcherOp::Equal,
            MatchOp::NotEqual => MatcherOp::NotEqual,
            MatchOp::Re(_) => MatcherOp::RegexMatch,
            MatchOp::NotRe(_) => MatcherOp::RegexNotMatch,
        };
        matchers.push(LabelMatcher {
            name: matcher.name.clone(),
            op,
            value: matcher.value.clone(),
        });
    }

    Ok(SeriesQuery {
        metric_name,
        snapshot_id: snapshot_id.or_else(|| ctx_snapshot.map(str::to_string)),
        matchers,
    })
}

fn aggregation_op(op: &TokenType) -> Result<AggregationOp, PromQLError> {
    match op.id() {
        token::T_SUM => Ok(AggregationOp::Sum),
        token::T_AVG => Ok(AggregationOp::Avg),
        token::T_MIN => Ok(AggregationOp::Min),
        token::T_MAX => Ok(AggregationOp::Max),
        token::T_COUNT => Ok(AggregationOp::Count),
        _ => Err(PromQLError::UnsupportedFeature(format!(
            "aggregation operator {op:?} is not supported"
        ))),
    }
}

fn function_name(name: &str) -> Result<FunctionName, PromQLError> {
    match name {
        "rate" => Ok(FunctionName::Rate),
        "irate" => Ok(FunctionName::Irate),
        "increase" => Ok(FunctionName::Increase),
        other => Err(PromQLError::UnsupportedFeature(format!(
            "function '{other}' is not supported"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_str(query: &str, snapshot: Option<&str>) -> Result<QueryPlan, PromQLError> {
        let expr = parser::parse(query).unwrap();
        plan(&expr, snapshot)
    }

    #[test]
    fn test_job_matcher_becomes_snapshot() {
        let plan = plan_str(r#"cpu_utilization_rate{job="snap1", node="n1"}"#, None).unwrap();

        assert_eq!(plan.series.len(), 1);
        let sq = &plan.series[0];
        assert_eq!(sq.metric_name, "cpu_utilization_rate");
        assert_eq!(sq.snapshot_id.as_deref(), Some("snap1"));
        // the job matcher is consumed, not duplicated
        assert_eq!(sq.matchers.len(), 1);
        assert_eq!(sq.matchers[0].name, "node");
        assert_eq!(sq.matchers[0].op, MatcherOp::Equal);
    }

    #[test]
    fn test_context_snapshot_fallback() {
        let plan = plan_str("cpu_utilization_rate", Some("ctx-snap")).unwrap();
        assert_eq!(plan.series[0].snapshot_id.as_deref(), Some("ctx-snap"));

        // an explicit job matcher wins over the context
        let plan = plan_str(r#"cpu_utilization_rate{job="snap1"}"#, Some("ctx-snap")).unwrap();
        assert_eq!(plan.series[0].snapshot_id.as_deref(), Some("snap1"));
    }

    #[test]
    fn test_non_equality_job_matcher_stays_a_matcher() {
        let plan = plan_str(r#"m{job!="snap1"}"#, Some("ctx-snap")).unwrap();
        let sq = &plan.series[0];
        assert_eq!(sq.matchers.len(), 1);
        assert_eq!(sq.matchers[0].name, "job");
        assert_eq!(sq.matchers[0].op, MatcherOp::NotEqual);
    }

    #[test]
    fn test_regex_matchers_recorded() {
        let plan = plan_str(r#"m{node=~"n.%", bucket!~"tmp%"}"#, None).unwrap();
        let ops: Vec<MatcherOp> = plan.series[0].matchers.iter().map(|m| m.op).collect();
        assert_eq!(ops, vec![MatcherOp::RegexMatch, MatcherOp::RegexNotMatch]);
    }

    #[test]
    fn test_aggregation_by() {
        let plan = plan_str(r#"sum by (node)(rate(http_requests_total{job="snap1"}[1m]))"#, None)
            .unwrap();

        let agg = plan.aggregation.unwrap();
        assert_eq!(agg.op, AggregationOp::Sum);
        assert_eq!(agg.grouping, vec!["node"]);
        assert!(!agg.without);

        let func = plan.function.unwrap();
        assert_eq!(func.name, FunctionName::Rate);
        assert_eq!(func.range, Duration::from_secs(60));
    }

    #[test]
    fn test_aggregation_without() {
        let plan = plan_str("avg without (node, bucket)(memory_used)", None).unwrap();
        let agg = plan.aggregation.unwrap();
        assert_eq!(agg.op, AggregationOp::Avg);
        assert_eq!(agg.grouping, vec!["node", "bucket"]);
        assert!(agg.without);
    }

    #[test]
    fn test_bare_aggregation_has_empty_grouping() {
        let plan = plan_str("max(memory_used)", None).unwrap();
        let agg = plan.aggregation.unwrap();
        assert_eq!(agg.op, AggregationOp::Max);
        assert!(agg.grouping.is_empty());
        assert!(!agg.without);
    }

    #[test]
    fn test_unsupported_shapes_rejected() {
        assert!(matches!(
            plan_str("topk(3, memory_used)", None),
            Err(PromQLError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            plan_str("histogram_quantile(0.95, m_bucket)", None),
            Err(PromQLError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            plan_str("rate(m[5m])[30m:1m]", None),
            Err(PromQLError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            plan_str("42", None),
            Err(PromQLError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn test_binary_expression_unions_series() {
        let plan = plan_str(r#"m{node="n1"} + m{node="n2"}"#, None).unwrap();
        assert_eq!(plan.series.len(), 2);
    }

    #[test]
    fn test_should_batch_bounds() {
        let sq = |metric: &str, node: &str| SeriesQuery {
            metric_name: metric.to_string(),
            snapshot_id: Some("snap1".to_string()),
            matchers: vec![LabelMatcher {
                name: "node".to_string(),
                op: MatcherOp::Equal,
                value: node.to_string(),
            }],
        };

        let mut plan = QueryPlan::default();
        for i in 0..4 {
            plan.series.push(sq("m", &format!("n{i}")));
        }
        assert!(!plan.should_batch());

        plan.series.push(sq("m", "n4"));
        assert!(plan.should_batch());

        // mixed metric names never batch
        plan.series.push(sq("other", "n5"));
        assert!(!plan.should_batch());

        // above the ceiling
        let mut plan = QueryPlan::default();
        for i in 0..21 {
            plan.series.push(sq("m", &format!("n{i}")));
        }
        assert!(!plan.should_batch());
    }
}
