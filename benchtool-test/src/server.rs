//! Exposes an in-process fake backend for use in integration tests.
//!
//! The server accepts remote-write pushes on `/api/v1/push` and answers instant and range queries
//! under `/prometheus/api/v1/`. Everything it receives is recorded for later inspection.
//!
//! ```
//! use benchtool_test::server::TestServer;
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = TestServer::new().await;
//!    let endpoint = server.addr();
//!    // point the benchmark at the endpoint...
//! }
//! ```

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Json, Router};
use benchtool_engine::write::proto::{self, TimeSeries, WriteRequest};

/// A remote-write request received by the [`TestServer`].
#[derive(Clone, Debug)]
pub struct Push {
    pub headers: HeaderMap,
    pub request: WriteRequest,
}

/// A query received by the [`TestServer`].
#[derive(Clone, Debug)]
pub struct ReceivedQuery {
    /// Either `query` or `query_range`.
    pub endpoint: &'static str,
    pub params: HashMap<String, String>,
    pub headers: HeaderMap,
}

#[derive(Debug)]
struct Recorder {
    pushes: Mutex<Vec<Push>>,
    queries: Mutex<Vec<ReceivedQuery>>,
    push_status: AtomicU16,
    push_delay_ms: AtomicU64,
}

type SharedRecorder = Arc<Recorder>;

/// An in-process fake backend for use in integration tests.
///
/// It listens on a random available port on localhost and stops when dropped.
#[derive(Debug)]
pub struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    recorder: SharedRecorder,
}

impl TestServer {
    pub async fn new() -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let recorder = Arc::new(Recorder {
            pushes: Mutex::default(),
            queries: Mutex::default(),
            push_status: AtomicU16::new(StatusCode::OK.as_u16()),
            push_delay_ms: AtomicU64::new(0),
        });

        let app = Router::new()
            .route("/api/v1/push", post(push))
            .route("/prometheus/api/v1/query", post(query))
            .route("/prometheus/api/v1/query_range", post(query_range))
            .with_state(recorder.clone());

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            handle,
            socket,
            recorder,
        }
    }

    /// Returns the `host:port` address of the server.
    pub fn addr(&self) -> String {
        self.socket.to_string()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://{}/{}", self.socket, path)
    }

    /// Sets the status code returned for subsequent pushes.
    pub fn set_push_status(&self, status: StatusCode) {
        self.recorder
            .push_status
            .store(status.as_u16(), Ordering::Relaxed);
    }

    /// Delays the response to subsequent pushes.
    ///
    /// A push is only recorded once its delay has passed.
    pub fn set_push_delay(&self, delay: Duration) {
        self.recorder
            .push_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Returns all pushes received so far, including rejected ones.
    pub fn pushes(&self) -> Vec<Push> {
        self.recorder.pushes.lock().unwrap().clone()
    }

    /// Returns all series received so far, in the order of arrival.
    pub fn received_series(&self) -> Vec<TimeSeries> {
        self.pushes()
            .into_iter()
            .flat_map(|push| push.request.timeseries)
            .collect()
    }

    /// Returns all queries received so far.
    pub fn queries(&self) -> Vec<ReceivedQuery> {
        self.recorder.queries.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn push(State(recorder): State<SharedRecorder>, headers: HeaderMap, body: Bytes) -> Response {
    let request = match proto::decode(&body) {
        Ok(request) => request,
        Err(error) => return (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
    };

    let delay = recorder.push_delay_ms.load(Ordering::Relaxed);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    recorder
        .pushes
        .lock()
        .unwrap()
        .push(Push { headers, request });

    let status = StatusCode::from_u16(recorder.push_status.load(Ordering::Relaxed))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, "").into_response()
}

fn record_query(
    recorder: &Recorder,
    endpoint: &'static str,
    headers: HeaderMap,
    params: HashMap<String, String>,
) {
    recorder.queries.lock().unwrap().push(ReceivedQuery {
        endpoint,
        params,
        headers,
    });
}

async fn query(
    State(recorder): State<SharedRecorder>,
    headers: HeaderMap,
    Form(params): Form<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    record_query(&recorder, "query", headers, params);
    Json(serde_json::json!({
        "status": "success",
        "data": { "resultType": "vector", "result": [] },
    }))
}

async fn query_range(
    State(recorder): State<SharedRecorder>,
    headers: HeaderMap,
    Form(params): Form<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    record_query(&recorder, "query_range", headers, params);
    Json(serde_json::json!({
        "status": "success",
        "data": { "resultType": "matrix", "result": [] },
    }))
}
