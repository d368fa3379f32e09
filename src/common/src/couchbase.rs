//! Thin client for the Couchbase query (SQL++) service.
//!
//! Both the metadata store and the query plane talk to the cluster through
//! this REST surface; per-request options are limited to a timeout.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::MetadataConfig;

#[derive(Debug, Error)]
pub enum CouchbaseError {
    #[error("query service request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("query service returned {status}: {message}")]
    Query { status: String, message: String },
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<Value>,
    status: String,
    #[serde(default)]
    errors: Vec<QueryServiceError>,
}

#[derive(Debug, Deserialize)]
struct QueryServiceError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

/// Executes SQL++ statements against a cluster's query service.
pub struct QueryClient {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
    timeout: Duration,
}

impl QueryClient {
    pub fn new(config: &MetadataConfig) -> Result<Self, CouchbaseError> {
        Self::from_parts(
            &config.host,
            config.query_port,
            &config.username,
            &config.password,
            config.timeout,
        )
    }

    pub fn from_parts(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, CouchbaseError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("http://{host}:{port}/query/service"),
            username: username.to_string(),
            password: password.to_string(),
            timeout,
        })
    }

    /// Execute a statement with positional parameters and return its rows.
    pub async fn execute(
        &self,
        statement: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, CouchbaseError> {
        let mut body = serde_json::Map::new();
        body.insert("statement".to_string(), Value::String(statement.to_string()));
        body.insert(
            "timeout".to_string(),
            Value::String(format!("{}s", self.timeout.as_secs())),
        );
        if !args.is_empty() {
            body.insert("args".to_string(), Value::Array(args));
        }

        let resp = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        let parsed: QueryResponse = serde_json::from_str(&text).map_err(|_| {
            CouchbaseError::Query {
                status: status.to_string(),
                message: text.chars().take(512).collect(),
            }
        })?;

        if parsed.status != "success" {
            let message = parsed
                .errors
                .first()
                .map(|e| format!("[{}] {}", e.code, e.msg))
                .unwrap_or_else(|| "unknown query error".to_string());
            return Err(CouchbaseError::Query {
                status: parsed.status,
                message,
            });
        }

        Ok(parsed.results)
    }

    /// Cheap connectivity probe used at startup.
    pub async fn ping(&self) -> Result<(), CouchbaseError> {
        self.execute("SELECT RAW 1", Vec::new()).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_config() {
        let config = MetadataConfig::default();
        let client = QueryClient::new(&config).unwrap();
        assert_eq!(client.endpoint, "http://localhost:8093/query/service");
    }

    #[test]
    fn test_error_response_parsing() {
        let raw = r#"{"requestID":"x","errors":[{"code":3000,"msg":"syntax error"}],"status":"fatal"}"#;
        let parsed: QueryResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, "fatal");
        assert_eq!(parsed.errors[0].code, 3000);
        assert!(parsed.results.is_empty());
    }

    #[test]
    fn test_success_response_parsing() {
        let raw = r#"{"results":[{"time":"2024-01-01T00:00:00Z","value":1.5}],"status":"success"}"#;
        let parsed: QueryResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, "success");
        assert_eq!(parsed.results.len(), 1);
    }
}
