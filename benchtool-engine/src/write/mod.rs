//! The write dispatcher.
//!
//! On every send tick, [`WriteBench`] generates the samples of all series for the current time,
//! splits them into batches and hands them to a bounded pool of workers. Each worker pushes its
//! batch to a randomly chosen backend address using the Prometheus remote-write protocol.
//!
//! The batch channel holds at most one batch per worker. When all workers are busy, the tick loop
//! blocks until a worker frees up, which throttles generation to the throughput of the backend.

use std::sync::Arc;
use std::time::SystemTime;

use flume::Receiver;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::balancer::{Balancer, ClientFactory};
use crate::discovery::Discovery;
use crate::error::SetupError;
use crate::http::{self, BasicAuth, ClientOptions};
use crate::metrics::Metrics;
use crate::workload::WriteWorkload;

pub mod client;
pub mod proto;

pub use self::client::{WriteClient, WriteError};
use self::proto::TimeSeries;

/// Configuration of the write dispatcher.
#[derive(Clone, Debug)]
pub struct WriteConfig {
    /// Identity of the run, sent as the `bench_id` label.
    pub id: String,
    /// The remote-write endpoint target, see [`discovery`](crate::discovery).
    pub endpoint: String,
    /// Number of concurrent write workers.
    pub workers: usize,
    /// Optional tenant sent with every request.
    pub tenant_id: Option<String>,
    /// Optional basic authentication.
    pub basic_auth: Option<BasicAuth>,
}

/// Splits series into contiguous batches of at most `batch_size` series, keeping their order.
pub fn split_batches(series: Vec<TimeSeries>, batch_size: usize) -> Vec<Vec<TimeSeries>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(series.len().div_ceil(batch_size));

    let mut series = series.into_iter();
    loop {
        let batch: Vec<_> = series.by_ref().take(batch_size).collect();
        if batch.is_empty() {
            break;
        }
        batches.push(batch);
    }

    batches
}

/// Generates the write workload and pushes it to the backend.
#[derive(Debug)]
pub struct WriteBench {
    id: String,
    workers: usize,
    workload: WriteWorkload,
    balancer: Arc<Balancer<WriteClient>>,
    metrics: Arc<Metrics>,
}

impl WriteBench {
    /// Creates the dispatcher and resolves the endpoint for the first time.
    ///
    /// Fails if the endpoint does not resolve to at least one address.
    pub async fn new(
        config: WriteConfig,
        workload: WriteWorkload,
        discovery: Arc<dyn Discovery>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SetupError> {
        if config.workers == 0 {
            return Err(SetupError::NoWorkers);
        }

        let options = Arc::new(ClientOptions {
            timeout: workload.options().timeout,
            basic_auth: config.basic_auth,
            tenant_id: config.tenant_id,
        });

        let http = http::reqwest_client()?;
        let make_client: ClientFactory<WriteClient> = {
            let metrics = metrics.clone();
            Box::new(move |address: &str| {
                WriteClient::new(http.clone(), address, options.clone(), metrics.clone())
            })
        };

        let balancer = Balancer::new(
            config.endpoint.clone(),
            discovery,
            make_client,
            metrics.resolved_gauge(&config.endpoint),
        )
        .await?;

        Ok(Self {
            id: config.id,
            workers: config.workers,
            workload,
            balancer: Arc::new(balancer),
            metrics,
        })
    }

    /// The compiled write workload.
    pub fn workload(&self) -> &WriteWorkload {
        &self.workload
    }

    /// Runs the write loop until the token is cancelled.
    ///
    /// After cancellation, batches already queued are still written. This returns once all
    /// workers have finished.
    pub async fn run(mut self, token: CancellationToken) {
        let mut tasks = JoinSet::new();
        tasks.spawn({
            let balancer = self.balancer.clone();
            let token = token.clone();
            async move { balancer.run_resolver(token).await }
        });

        let (batch_tx, batch_rx) = flume::bounded(self.workers);
        for _ in 0..self.workers {
            tasks.spawn(write_worker(self.balancer.clone(), batch_rx.clone()));
        }
        drop(batch_rx);

        let period = self.workload.options().interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            series = self.workload.total_series(),
            replicas = self.workload.replicas(),
            workers = self.workers,
            "starting write benchmark"
        );

        'ticks: loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let series = self
                .workload
                .generate_time_series(&self.id, SystemTime::now());
            let batch_size = self.workload.options().batch_size;

            for batch in split_batches(series, batch_size) {
                let len = batch.len() as u64;
                tokio::select! {
                    _ = token.cancelled() => break 'ticks,
                    result = batch_tx.send_async(batch) => {
                        if result.is_err() {
                            break 'ticks;
                        }
                    }
                }

                self.metrics.write_batches.inc();
                self.metrics.write_series.inc_by(len);
            }
        }

        drop(batch_tx);
        while tasks.join_next().await.is_some() {}
        tracing::info!("write benchmark stopped");
    }
}

async fn write_worker(balancer: Arc<Balancer<WriteClient>>, batches: Receiver<Vec<TimeSeries>>) {
    while let Ok(batch) = batches.recv_async().await {
        let Some((address, client)) = balancer.pick() else {
            tracing::error!("unable to get client, no addresses resolved");
            continue;
        };

        if let Err(error) = client.store(batch).await {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                %address,
                recoverable = error.is_recoverable(),
                "unable to write request"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::proto::{Label, Sample};
    use super::*;

    fn series(count: usize) -> Vec<TimeSeries> {
        (0..count)
            .map(|i| TimeSeries {
                labels: vec![Label::new("__name__", format!("s{i}"))],
                samples: vec![Sample {
                    value: i as f64,
                    timestamp: 0,
                }],
            })
            .collect()
    }

    #[test]
    fn splits_into_full_batches() {
        let batches = split_batches(series(1000), 500);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|batch| batch.len() == 500));
    }

    #[test]
    fn keeps_remainder_batch() {
        let input = series(1001);
        let batches = split_batches(input.clone(), 500);

        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, [500, 500, 1]);
        assert_eq!(batches.concat(), input);
    }

    #[test]
    fn small_input_is_single_batch() {
        let batches = split_batches(series(3), 500);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert!(split_batches(Vec::new(), 500).is_empty());
    }
}
