//! PromQL front-end: parse an expression, plan it, lower the plan to SQL++
//! against the time-series collection, and transform the rows back into
//! Prometheus wire shape.

pub mod error;
pub mod parser;
pub mod plan;
pub mod sqlbuilder;
pub mod transformer;

pub use error::PromQLError;
pub use plan::QueryPlan;

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

/// Default resolution step for range queries.
pub const DEFAULT_STEP: Duration = Duration::from_secs(15);

/// Evaluation context for one query: a single instant, or a `[start, end]`
/// window with a step, plus an optional snapshot id used when the query
/// carries no `job` matcher.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub time: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub step: Duration,
    pub is_range: bool,
    pub snapshot_id: Option<String>,
}

impl EvalContext {
    pub fn instant(time: DateTime<Utc>, snapshot_id: Option<String>) -> Self {
        Self {
            time,
            start: time,
            end: time,
            step: DEFAULT_STEP,
            is_range: false,
            snapshot_id,
        }
    }

    pub fn range(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
        snapshot_id: Option<String>,
    ) -> Self {
        Self {
            time: end,
            start,
            end,
            step,
            is_range: true,
            snapshot_id,
        }
    }
}

/// Parse a Prometheus API time parameter: epoch seconds (a >1e10 value is
/// taken as milliseconds) or RFC 3339.
pub fn parse_time(value: &str) -> Result<DateTime<Utc>, PromQLError> {
    if let Ok(ts) = value.parse::<f64>() {
        let millis = if ts > 1e10 { ts } else { ts * 1000.0 };
        return Utc
            .timestamp_millis_opt(millis as i64)
            .single()
            .ok_or_else(|| PromQLError::InvalidTime(value.to_string()));
    }

    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| PromQLError::InvalidTime(value.to_string()))
}

/// Parse a Prometheus API step parameter: bare seconds or a duration
/// literal such as `15s` / `5m`.
pub fn parse_step(value: &str) -> Result<Duration, PromQLError> {
    if let Ok(secs) = value.parse::<f64>() {
        if secs > 0.0 {
            return Ok(Duration::from_secs_f64(secs));
        }
        return Err(PromQLError::InvalidTime(value.to_string()));
    }
    humantime::parse_duration(value).map_err(|_| PromQLError::InvalidTime(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_epoch_seconds() {
        let t = parse_time("1700000000").unwrap();
        assert_eq!(t.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_time_epoch_millis_heuristic() {
        let t = parse_time("1700000000000").unwrap();
        assert_eq!(t.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_time_rfc3339() {
        let t = parse_time("2023-11-14T22:13:20Z").unwrap();
        assert_eq!(t.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn test_parse_step() {
        assert_eq!(parse_step("15").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_step("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_step("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_step("0").is_err());
        assert!(parse_step("soon").is_err());
    }

    #[test]
    fn test_instant_context_window() {
        let t = parse_time("1700000000").unwrap();
        let ctx = EvalContext::instant(t, Some("snap1".to_string()));
        assert!(!ctx.is_range);
        assert_eq!(ctx.start, ctx.end);
        assert_eq!(ctx.snapshot_id.as_deref(), Some("snap1"));
    }
}
