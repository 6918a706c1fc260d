//! Remote-write client for a single backend address.

use std::sync::Arc;
use std::time::Instant;

use reqwest::StatusCode;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use thiserror::Error;

use crate::http::ClientOptions;
use crate::metrics::{Metrics, WriteLabels};
use crate::write::proto::{self, TimeSeries};

/// Error response bodies are truncated to this many bytes.
const MAX_ERROR_MESSAGE_LEN: usize = 512;

/// The remote-write protocol version sent with every request.
const REMOTE_WRITE_VERSION: &str = "0.1.0";

/// Errors pushing a batch of series.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The batch could not be compressed.
    #[error("failed to encode write request: {0}")]
    Encode(#[from] snap::Error),
    /// The request did not produce a response.
    #[error("failed to send write request: {0}")]
    Transport(#[from] reqwest::Error),
    /// The backend rejected the request.
    #[error("server returned HTTP status {status}: {message}")]
    Status { status: StatusCode, message: String },
}

impl WriteError {
    /// Returns `true` if retrying the same request may succeed.
    ///
    /// Transport failures and server errors are recoverable, client errors are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            WriteError::Encode(_) => false,
            WriteError::Transport(_) => true,
            WriteError::Status { status, .. } => status.is_server_error(),
        }
    }
}

/// Pushes batches of series to the remote-write endpoint of one address.
#[derive(Debug)]
pub struct WriteClient {
    http: reqwest::Client,
    url: String,
    options: Arc<ClientOptions>,
    metrics: Arc<Metrics>,
}

impl WriteClient {
    /// Creates a client pushing to `http://{address}/api/v1/push`.
    pub fn new(
        http: reqwest::Client,
        address: &str,
        options: Arc<ClientOptions>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            http,
            url: format!("http://{address}/api/v1/push"),
            options,
            metrics,
        }
    }

    /// Encodes and sends a batch of series.
    ///
    /// The request latency is recorded by response status code.
    pub async fn store(&self, timeseries: Vec<TimeSeries>) -> Result<StatusCode, WriteError> {
        let body = proto::encode(timeseries)?;

        let request = self
            .http
            .post(&self.url)
            .header(CONTENT_ENCODING, "snappy")
            .header(CONTENT_TYPE, "application/x-protobuf")
            .header("X-Prometheus-Remote-Write-Version", REMOTE_WRITE_VERSION)
            .body(body);

        let start = Instant::now();
        let result = self.options.apply(request).send().await;

        let code = match &result {
            Ok(response) => response.status().as_u16().to_string(),
            Err(_) => "error".to_owned(),
        };
        self.metrics
            .write_request_duration
            .get_or_create(&WriteLabels { code })
            .observe(start.elapsed().as_secs_f64());

        let response = result?;
        let status = response.status();
        if status.is_success() {
            return Ok(status);
        }

        let body = response.bytes().await.unwrap_or_default();
        Err(WriteError::Status {
            status,
            message: error_message(&body),
        })
    }
}

/// Returns the first line of the truncated error body.
fn error_message(body: &[u8]) -> String {
    let truncated = &body[..body.len().min(MAX_ERROR_MESSAGE_LEN)];
    let message = String::from_utf8_lossy(truncated);
    message.lines().next().unwrap_or_default().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_is_first_line() {
        assert_eq!(error_message(b"out of order sample\ndetails"), "out of order sample");
        assert_eq!(error_message(b""), "");
    }

    #[test]
    fn error_message_is_truncated() {
        let body = "x".repeat(2048);
        assert_eq!(error_message(body.as_bytes()).len(), MAX_ERROR_MESSAGE_LEN);
    }

    #[test]
    fn classifies_recoverable_statuses() {
        let error = |status| WriteError::Status {
            status,
            message: String::new(),
        };

        assert!(error(StatusCode::INTERNAL_SERVER_ERROR).is_recoverable());
        assert!(error(StatusCode::SERVICE_UNAVAILABLE).is_recoverable());
        assert!(!error(StatusCode::BAD_REQUEST).is_recoverable());
        assert!(!error(StatusCode::TOO_MANY_REQUESTS).is_recoverable());
    }
}
