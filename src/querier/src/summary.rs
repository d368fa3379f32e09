//! Summary statistics for the metric summary endpoints.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

/// Percentiles always included in a summary.
const DEFAULT_PERCENTILES: [f64; 3] = [0.50, 0.90, 0.99];

/// Query parameters that are never interpreted as label filters.
const RESERVED_PARAMS: [&str; 2] = ["percentiles", "p"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub percentiles: BTreeMap<String, f64>,
}

impl MetricSummary {
    fn empty() -> Self {
        Self {
            count: 0,
            avg: 0.0,
            min: 0.0,
            max: 0.0,
            percentiles: BTreeMap::new(),
        }
    }
}

/// Count/avg/min/max plus P50/P90/P99 and any caller percentiles. Caller
/// percentiles never overwrite a default with the same key.
pub fn compute_summary(values: &[f64], extra_percentiles: &[f64]) -> MetricSummary {
    if values.is_empty() {
        return MetricSummary::empty();
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();

    let mut percentiles = BTreeMap::new();
    for p in DEFAULT_PERCENTILES {
        percentiles.insert(format_percentile_key(p), percentile(&sorted, p));
    }
    for &p in extra_percentiles {
        let key = format_percentile_key(p);
        percentiles
            .entry(key)
            .or_insert_with(|| percentile(&sorted, p));
    }

    MetricSummary {
        count,
        avg: sum / count as f64,
        min: sorted[0],
        max: sorted[count - 1],
        percentiles,
    }
}

/// Percentile by linear interpolation between the two nearest ranks.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }

    let position = p * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = lower + 1;
    let weight = position - lower as f64;

    if upper >= sorted.len() {
        return sorted[sorted.len() - 1];
    }
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Two decimals, then trailing zeros and a trailing dot stripped:
/// `0.50 → "0.5"`, `0.99 → "0.99"`.
pub fn format_percentile_key(p: f64) -> String {
    let key = format!("{p:.2}");
    key.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Parse a comma-separated percentile list. Values outside `[0, 1]` and
/// anything unparseable are dropped with a warning; the result is deduped
/// and sorted.
pub fn parse_percentiles(raw: &str) -> Vec<f64> {
    let mut percentiles: Vec<f64> = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Ok(p) = part.parse::<f64>() else {
            log::warn!("Invalid percentile value '{part}', skipping");
            continue;
        };
        if !(0.0..=1.0).contains(&p) {
            log::warn!("Percentile value {p} out of range [0.0, 1.0], skipping");
            continue;
        }
        if !percentiles.contains(&p) {
            percentiles.push(p);
        }
    }
    percentiles.sort_by(f64::total_cmp);
    percentiles
}

/// Split query parameters into label filters and percentiles. `percentiles`
/// and `p` are reserved; every other parameter is an equality label filter.
pub fn parse_query_params(
    params: &HashMap<String, String>,
) -> (BTreeMap<String, String>, Vec<f64>) {
    let mut percentiles = Vec::new();
    if let Some(raw) = params.get("percentiles").or_else(|| params.get("p")) {
        percentiles = parse_percentiles(raw);
    }

    let filters = params
        .iter()
        .filter(|(k, _)| !RESERVED_PARAMS.contains(&k.to_lowercase().as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    (filters, percentiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_bounds() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 1.0), 5.0);

        let pair = [1.0, 2.0];
        assert_eq!(percentile(&pair, 0.5), 1.5);

        assert_eq!(percentile(&[7.0], 0.9), 7.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn test_summary_matches_reference_values() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let summary = compute_summary(&values, &[0.25, 0.75]);

        assert_eq!(summary.count, 10);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 10.0);
        assert_eq!(summary.avg, 5.5);

        assert_eq!(summary.percentiles["0.5"], 5.5);
        assert!((summary.percentiles["0.9"] - 9.1).abs() < 1e-9);
        assert!((summary.percentiles["0.99"] - 9.91).abs() < 1e-9);
        assert_eq!(summary.percentiles["0.25"], 3.25);
        assert_eq!(summary.percentiles["0.75"], 7.75);
    }

    #[test]
    fn test_empty_summary() {
        let summary = compute_summary(&[], &[0.5]);
        assert_eq!(summary.count, 0);
        assert!(summary.percentiles.is_empty());
    }

    #[test]
    fn test_percentile_key_formatting() {
        assert_eq!(format_percentile_key(0.50), "0.5");
        assert_eq!(format_percentile_key(0.90), "0.9");
        assert_eq!(format_percentile_key(0.99), "0.99");
        assert_eq!(format_percentile_key(0.25), "0.25");
        assert_eq!(format_percentile_key(1.0), "1");
    }

    #[test]
    fn test_parse_percentiles() {
        assert_eq!(parse_percentiles("0.5,0.95"), vec![0.5, 0.95]);
        // deduped and sorted
        assert_eq!(parse_percentiles("0.9, 0.5, 0.9"), vec![0.5, 0.9]);
        // out-of-range and garbage dropped
        assert_eq!(parse_percentiles("1.5,-0.1,abc,0.75"), vec![0.75]);
        assert!(parse_percentiles("").is_empty());
    }

    #[test]
    fn test_parse_query_params_reserved_names() {
        let mut params = HashMap::new();
        params.insert("p".to_string(), "0.25,0.75".to_string());
        params.insert("node".to_string(), "n1".to_string());
        params.insert("bucket".to_string(), "beer-sample".to_string());

        let (filters, percentiles) = parse_query_params(&params);
        assert_eq!(percentiles, vec![0.25, 0.75]);
        assert_eq!(filters.len(), 2);
        assert_eq!(filters["node"], "n1");
        assert!(!filters.contains_key("p"));
    }

    #[test]
    fn test_percentiles_param_takes_precedence() {
        let mut params = HashMap::new();
        params.insert("percentiles".to_string(), "0.1".to_string());
        params.insert("p".to_string(), "0.2".to_string());

        let (_, percentiles) = parse_query_params(&params);
        assert_eq!(percentiles, vec![0.1]);
    }
}
