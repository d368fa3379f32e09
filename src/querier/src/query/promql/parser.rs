//! PromQL parser wrapper
//!
//! Thin layer over the promql-parser crate with cbscope-specific error
//! handling and the helpers the planner builds on.

use promql_parser::parser::{self, Expr, VectorSelector};

use super::error::PromQLError;

/// Parse a PromQL query string into an AST expression
pub fn parse(query: &str) -> Result<Expr, PromQLError> {
    parser::parse(query).map_err(|e| PromQLError::ParseError(format!("{e:?}")))
}

/// Check if a query string is syntactically valid
pub fn validate(query: &str) -> Result<(), PromQLError> {
    parse(query).map(|_| ())
}

/// Extract the metric name from a vector selector.
///
/// Returns `None` if the selector only matches `__name__` by regex.
pub fn metric_name(vs: &VectorSelector) -> Option<&str> {
    if let Some(name) = vs.name.as_deref() {
        return Some(name);
    }
    for matcher in vs.matchers.matchers.iter() {
        if matcher.name == "__name__"
            && matches!(matcher.op, promql_parser::label::MatchOp::Equal)
        {
            return Some(&matcher.value);
        }
    }
    None
}
