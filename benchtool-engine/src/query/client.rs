//! Client for the Prometheus HTTP query API.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::http::ClientOptions;

/// Resolution step of range queries.
pub const RANGE_STEP: Duration = Duration::from_secs(60);

/// Errors executing a query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The request did not produce a valid response.
    #[error("failed to send query request: {0}")]
    Transport(#[from] reqwest::Error),
    /// The API responded with an unsuccessful status.
    #[error("query failed with status {status} ({error_type}): {error}")]
    Api {
        status: StatusCode,
        error_type: String,
        error: String,
    },
}

/// The envelope of every query API response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub status: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Formats a point in time as fractional Unix seconds.
fn format_time(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default();
    format!("{secs:.3}")
}

/// Sends instant and range queries to the query API of one address.
#[derive(Debug)]
pub struct QueryClient {
    http: reqwest::Client,
    base_url: String,
    options: Arc<ClientOptions>,
}

impl QueryClient {
    /// Creates a client for the API rooted at `http://{address}{path_prefix}`.
    pub fn new(
        http: reqwest::Client,
        address: &str,
        path_prefix: &str,
        options: Arc<ClientOptions>,
    ) -> Self {
        let prefix = path_prefix.trim_matches('/');
        let base_url = if prefix.is_empty() {
            format!("http://{address}")
        } else {
            format!("http://{address}/{prefix}")
        };

        Self {
            http,
            base_url,
            options,
        }
    }

    /// The root URL of the query API.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Evaluates an instant query at the given time.
    pub async fn query(&self, expr: &str, time: SystemTime) -> Result<ApiResponse, QueryError> {
        self.post("/api/v1/query", &[("query", expr.to_owned()), ("time", format_time(time))])
            .await
    }

    /// Evaluates a range query between `start` and `end`.
    pub async fn query_range(
        &self,
        expr: &str,
        start: SystemTime,
        end: SystemTime,
        step: Duration,
    ) -> Result<ApiResponse, QueryError> {
        let form = [
            ("query", expr.to_owned()),
            ("start", format_time(start)),
            ("end", format_time(end)),
            ("step", step.as_secs_f64().to_string()),
        ];
        self.post("/api/v1/query_range", &form).await
    }

    async fn post(&self, path: &str, form: &[(&str, String)]) -> Result<ApiResponse, QueryError> {
        let request = self
            .http
            .post(format!("{}{path}", self.base_url))
            .form(form);

        let response = self.options.apply(request).send().await?;
        let status = response.status();
        let body: ApiResponse = response.json().await?;

        if !status.is_success() || body.status != "success" {
            return Err(QueryError::Api {
                status,
                error_type: body.error_type.unwrap_or_else(|| "unknown".to_owned()),
                error: body.error.unwrap_or_default(),
            });
        }

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(prefix: &str) -> QueryClient {
        QueryClient::new(
            reqwest::Client::new(),
            "querier:8080",
            prefix,
            Arc::new(ClientOptions::default()),
        )
    }

    #[test]
    fn builds_base_url() {
        assert_eq!(client("/prometheus").base_url(), "http://querier:8080/prometheus");
        assert_eq!(client("prometheus/").base_url(), "http://querier:8080/prometheus");
        assert_eq!(client("").base_url(), "http://querier:8080");
    }

    #[test]
    fn formats_unix_seconds() {
        let time = UNIX_EPOCH + Duration::from_millis(1_700_000_000_250);
        assert_eq!(format_time(time), "1700000000.250");
    }

    #[test]
    fn parses_error_response() {
        let body: ApiResponse = serde_json::from_str(
            r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#,
        )
        .unwrap();
        assert_eq!(body.status, "error");
        assert_eq!(body.error_type.as_deref(), Some("bad_data"));
        assert_eq!(body.error.as_deref(), Some("parse error"));
        assert!(body.data.is_null());
    }
}
