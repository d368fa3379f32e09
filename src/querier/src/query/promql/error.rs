//! PromQL-specific error types

use thiserror::Error;

use common::ApiError;

/// Errors that can occur during PromQL parsing, planning, and evaluation
#[derive(Debug, Error)]
pub enum PromQLError {
    #[error("PromQL parse error: {0}")]
    ParseError(String),
    #[error("unsupported PromQL feature: {0}")]
    UnsupportedFeature(String),
    #[error("invalid time parameter: {0}")]
    InvalidTime(String),
    #[error("PromQL evaluation error: {0}")]
    EvaluationError(String),
}

impl From<PromQLError> for ApiError {
    fn from(err: PromQLError) -> Self {
        match err {
            PromQLError::EvaluationError(msg) => ApiError::Upstream(msg),
            other => ApiError::validation("query", &other.to_string()),
        }
    }
}
