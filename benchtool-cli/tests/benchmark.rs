//! Blackbox tests for a full benchmark run against the in-process fake backend.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use benchtool_cli::config::{Config, Credentials};
use benchtool_cli::runner::Benchmarker;
use benchtool_cli::web;
use benchtool_engine::metrics::Metrics;
use benchtool_test::server::TestServer;
use secrecy::SecretBox;
use tokio_util::sync::CancellationToken;

const WORKLOAD: &[u8] = br#"
replicas: 1
series:
  - name: requests_total
    type: counter-one
    static_labels:
      job: bench
    labels:
      - name: path
        value_prefix: path
        unique_values: 2
queries:
  - num_queries: 2
    expr_template: "sum(rate(<<.Name>>{<<.Matchers>>}[1m]))"
    series_type: counter-one
    interval: 50ms
write_options:
  interval: 50ms
  batch_size: 10
"#;

fn workload_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(WORKLOAD).unwrap();
    file
}

fn config(server: &TestServer, workload: &tempfile::NamedTempFile) -> Config {
    let mut config = Config {
        id: "cli-test".into(),
        workload_file: workload.path().to_owned(),
        ..Default::default()
    };

    config.write.endpoint = server.addr();
    config.write.tenant_id = Some("tenant-1".into());
    config.write.basic_auth = Some(Credentials {
        username: "bench".into(),
        password: SecretBox::new(Box::new("secret".into())),
    });

    config.query.enabled = true;
    config.query.endpoint = server.addr();
    config.query.workers = 2;

    config
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn runs_write_and_query_benchmarks() -> Result<()> {
    benchtool_test::tracing::init();
    let server = TestServer::new().await;
    let workload = workload_file();
    let config = config(&server, &workload);

    let metrics = Arc::new(Metrics::new());
    let benchmarker = Benchmarker::new(&config, metrics.clone()).await?;

    let token = CancellationToken::new();
    let task = tokio::spawn(benchmarker.run(token.clone()));
    wait_for(|| !server.pushes().is_empty() && server.queries().len() >= 2).await;
    token.cancel();
    task.await?;

    let push = &server.pushes()[0];
    assert_eq!(push.request.timeseries.len(), 2);
    assert_eq!(push.headers["x-scope-orgid"], "tenant-1");
    assert_eq!(push.headers["authorization"], "Basic YmVuY2g6c2VjcmV0");

    let series = &push.request.timeseries[0];
    let labels: Vec<_> = series
        .labels
        .iter()
        .map(|label| (label.name.as_str(), label.value.as_str()))
        .collect();
    assert_eq!(
        labels,
        [
            ("__name__", "requests_total"),
            ("job", "bench"),
            ("path", "path-0"),
            ("bench_replica", "replica-00000"),
            ("bench_id", "cli-test"),
        ]
    );

    let query = &server.queries()[0];
    assert_eq!(query.endpoint, "query");
    assert!(query.params["query"].starts_with("sum(rate(requests_total{"));
    // The query path has no tenant configured.
    assert!(!query.headers.contains_key("x-scope-orgid"));

    Ok(())
}

#[tokio::test]
async fn workload_options_override_configuration() -> Result<()> {
    let server = TestServer::new().await;
    let workload = workload_file();
    let mut config = config(&server, &workload);
    config.query.enabled = false;
    config.write.batch_size = 1;

    let metrics = Arc::new(Metrics::new());
    let benchmarker = Benchmarker::new(&config, metrics).await?;

    let token = CancellationToken::new();
    let task = tokio::spawn(benchmarker.run(token.clone()));
    wait_for(|| !server.pushes().is_empty()).await;
    token.cancel();
    task.await?;

    // `batch_size: 10` from the workload wins over the configured 1.
    assert_eq!(server.pushes()[0].request.timeseries.len(), 2);

    Ok(())
}

#[tokio::test]
async fn fails_on_missing_workload_file() {
    let server = TestServer::new().await;
    let workload = workload_file();
    let mut config = config(&server, &workload);
    config.workload_file = "/nonexistent/workload.yaml".into();

    let error = Benchmarker::new(&config, Arc::new(Metrics::new()))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("failed to load workload"));
}

#[tokio::test]
async fn fails_when_nothing_is_enabled() {
    let server = TestServer::new().await;
    let workload = workload_file();
    let mut config = config(&server, &workload);
    config.write.enabled = false;
    config.query.enabled = false;

    let result = Benchmarker::new(&config, Arc::new(Metrics::new())).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn serves_metrics() -> Result<()> {
    let server = TestServer::new().await;
    let workload = workload_file();
    let mut config = config(&server, &workload);
    config.query.enabled = false;

    let metrics = Arc::new(Metrics::new());
    let benchmarker = Benchmarker::new(&config, metrics.clone()).await?;

    let listener = web::listen("127.0.0.1:0".parse()?)?;
    let addr = listener.local_addr()?;

    let token = CancellationToken::new();
    let web_task = tokio::spawn(web::serve(listener, metrics, token.clone()));
    let bench_task = tokio::spawn(benchmarker.run(token.clone()));
    wait_for(|| !server.pushes().is_empty()).await;

    let client = reqwest::Client::new();
    let health = client.get(format!("http://{addr}/health")).send().await?;
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    // Metrics are recorded once the response has been processed.
    let mut body = String::new();
    for _ in 0..100 {
        body = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await?
            .text()
            .await?;
        if body.contains("benchtool_write_batches_total") && body.contains(r#"code="200""#) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(body.contains("benchtool_write_request_duration_seconds_bucket"));
    assert!(body.contains(r#"code="200""#));

    token.cancel();
    bench_task.await?;
    web_task.await??;

    Ok(())
}
