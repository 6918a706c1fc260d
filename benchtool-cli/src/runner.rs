//! Wiring of the configured benchmarks into a single run.

use std::sync::Arc;

use anyhow::{Context, Result};
use benchtool_engine::discovery::{Discovery, DnsDiscovery};
use benchtool_engine::http::ClientOptions;
use benchtool_engine::metrics::Metrics;
use benchtool_engine::query::{QueryConfig, QueryRunner, QueryWorkload};
use benchtool_engine::ring::TokenRing;
use benchtool_engine::ring_check::{RingCheckConfig, RingChecker};
use benchtool_engine::workload::{WorkloadDesc, WriteWorkload};
use benchtool_engine::write::{WriteBench, WriteConfig};
use tokio::signal::unix::SignalKind;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::web;

/// The benchmarks enabled in the configuration, ready to run.
#[derive(Debug)]
pub struct Benchmarker {
    write: Option<WriteBench>,
    query: Option<QueryRunner>,
    ring_check: Option<RingChecker>,
}

impl Benchmarker {
    /// Loads the workload file and sets up all enabled benchmarks.
    pub async fn new(config: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        let path = &config.workload_file;
        let desc = WorkloadDesc::from_path(path)
            .with_context(|| format!("failed to load workload from {}", path.display()))?;

        Self::with_workload(config, &desc, Arc::new(DnsDiscovery::new()), metrics).await
    }

    /// Sets up all enabled benchmarks for the given workload.
    ///
    /// Endpoints are resolved once here, so a benchmark with an unreachable endpoint fails
    /// before anything is sent.
    pub async fn with_workload(
        config: &Config,
        desc: &WorkloadDesc,
        discovery: Arc<dyn Discovery>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let options = desc.write.resolve(config.write.default_options())?;
        let workload = WriteWorkload::new(desc, options);
        tracing::info!(
            replicas = workload.replicas(),
            series = workload.total_series(),
            interval = ?options.interval,
            batch_size = options.batch_size,
            "compiled write workload"
        );

        let ring_check = if config.ring_check.enabled {
            let ring_config = &config.ring_check;
            let ring = TokenRing::new(
                ring_config.instances.clone(),
                ring_config.replication_factor,
                ring_config.num_tokens,
            )
            .context("failed to build ring")?;

            let checker_config = RingCheckConfig {
                id: config.id.clone(),
                tenant_id: ring_config.tenant_id.clone(),
                interval: ring_config.interval,
            };
            Some(RingChecker::new(
                checker_config,
                workload.clone(),
                Arc::new(ring),
            ))
        } else {
            None
        };

        let query = if config.query.enabled {
            let query_workload = QueryWorkload::new(&config.id, desc)?;
            let query_config = QueryConfig {
                endpoint: config.query.endpoint.clone(),
                path_prefix: config.query.path_prefix.clone(),
                workers: config.query.workers,
                client: ClientOptions {
                    timeout: config.query.timeout,
                    basic_auth: config.query.basic_auth.as_ref().map(|c| c.to_basic_auth()),
                    tenant_id: config.query.tenant_id.clone(),
                },
            };

            let runner = QueryRunner::new(
                query_config,
                query_workload,
                discovery.clone(),
                metrics.clone(),
            )
            .await
            .context("failed to set up query benchmark")?;
            Some(runner)
        } else {
            None
        };

        let write = if config.write.enabled {
            let write_config = WriteConfig {
                id: config.id.clone(),
                endpoint: config.write.endpoint.clone(),
                workers: config.write.workers,
                tenant_id: config.write.tenant_id.clone(),
                basic_auth: config.write.basic_auth.as_ref().map(|c| c.to_basic_auth()),
            };

            let bench = WriteBench::new(write_config, workload, discovery, metrics)
                .await
                .context("failed to set up write benchmark")?;
            Some(bench)
        } else {
            None
        };

        if write.is_none() && query.is_none() && ring_check.is_none() {
            anyhow::bail!("no benchmark enabled");
        }

        Ok(Self {
            write,
            query,
            ring_check,
        })
    }

    /// Runs all benchmarks until the token is cancelled and they have drained.
    pub async fn run(self, token: CancellationToken) {
        let mut tasks = JoinSet::new();

        if let Some(write) = self.write {
            tasks.spawn(write.run(token.clone()));
        }
        if let Some(query) = self.query {
            tasks.spawn(query.run(token.clone()));
        }
        if let Some(ring_check) = self.ring_check {
            tasks.spawn(ring_check.run(token.clone()));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(error) = result {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "benchmark task failed"
                );
            }
        }
    }
}

/// Runs the configured benchmarks and the metrics server until termination is requested.
pub async fn run(config: Config) -> Result<()> {
    tracing::info!(id = %config.id, "Starting benchmark");

    let metrics = Arc::new(Metrics::new());
    let benchmarker = Benchmarker::new(&config, metrics.clone()).await?;
    let listener = web::listen(config.http_addr).context("failed to start TCP listener")?;

    let token = CancellationToken::new();
    let server_handle = tokio::spawn(web::serve(listener, metrics, token.clone()));
    let bench_handle = tokio::spawn(benchmarker.run(token.clone()));

    tokio::spawn({
        let token = token.clone();
        async move {
            elegant_departure::get_shutdown_guard().wait().await;
            tracing::info!("Shutting down ...");
            token.cancel();
        }
    });

    elegant_departure::tokio::depart()
        .on_termination()
        .on_sigint()
        .on_signal(SignalKind::hangup())
        .on_signal(SignalKind::quit())
        .await;

    bench_handle.await?;
    let server_result = server_handle.await.map_err(From::from).flatten();
    tracing::info!("Shutdown complete");
    server_result
}
