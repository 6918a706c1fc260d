//! The query dispatcher.
//!
//! Every derived [`Query`] ticks on its own interval and hands itself to a bounded pool of
//! workers. Each worker executes the query against a randomly chosen backend address and
//! records the latency by outcome and query type.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use flume::{Receiver, Sender};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::balancer::{Balancer, ClientFactory};
use crate::discovery::Discovery;
use crate::error::SetupError;
use crate::http::{self, ClientOptions};
use crate::metrics::{Metrics, QueryLabels};

pub mod client;
mod workload;

pub use self::client::{QueryClient, QueryError, RANGE_STEP};
pub use self::workload::{Query, QueryWorkload};

/// Configuration of the query dispatcher.
#[derive(Clone, Debug)]
pub struct QueryConfig {
    /// The query endpoint target, see [`discovery`](crate::discovery).
    pub endpoint: String,
    /// Path under which the query API is served.
    pub path_prefix: String,
    /// Number of concurrent query workers.
    pub workers: usize,
    /// Per-request options.
    pub client: ClientOptions,
}

/// Runs the query workload against the backend.
#[derive(Debug)]
pub struct QueryRunner {
    workload: QueryWorkload,
    workers: usize,
    balancer: Arc<Balancer<QueryClient>>,
    metrics: Arc<Metrics>,
}

impl QueryRunner {
    /// Creates the dispatcher and resolves the endpoint for the first time.
    pub async fn new(
        config: QueryConfig,
        workload: QueryWorkload,
        discovery: Arc<dyn Discovery>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SetupError> {
        if config.workers == 0 {
            return Err(SetupError::NoWorkers);
        }

        let http = http::reqwest_client()?;
        let options = Arc::new(config.client);
        let path_prefix = config.path_prefix;
        let make_client: ClientFactory<QueryClient> = Box::new(move |address: &str| {
            QueryClient::new(http.clone(), address, &path_prefix, options.clone())
        });

        let balancer = Balancer::new(
            config.endpoint.clone(),
            discovery,
            make_client,
            metrics.resolved_gauge(&config.endpoint),
        )
        .await?;

        Ok(Self {
            workload,
            workers: config.workers,
            balancer: Arc::new(balancer),
            metrics,
        })
    }

    /// The derived queries.
    pub fn workload(&self) -> &QueryWorkload {
        &self.workload
    }

    /// Runs all queries on their schedules until the token is cancelled.
    pub async fn run(self, token: CancellationToken) {
        let mut tasks = JoinSet::new();
        tasks.spawn({
            let balancer = self.balancer.clone();
            let token = token.clone();
            async move { balancer.run_resolver(token).await }
        });

        let (query_tx, query_rx) = flume::bounded(self.workers);
        for _ in 0..self.workers {
            tasks.spawn(query_worker(
                self.balancer.clone(),
                self.metrics.clone(),
                query_rx.clone(),
            ));
        }
        drop(query_rx);

        tracing::info!(
            queries = self.workload.queries().len(),
            workers = self.workers,
            "starting query benchmark"
        );

        for query in self.workload.queries() {
            tasks.spawn(query_ticker(
                Arc::new(query.clone()),
                query_tx.clone(),
                token.clone(),
            ));
        }
        drop(query_tx);

        while tasks.join_next().await.is_some() {}
        tracing::info!("query benchmark stopped");
    }
}

async fn query_ticker(query: Arc<Query>, queries: Sender<Arc<Query>>, token: CancellationToken) {
    let start = tokio::time::Instant::now() + query.interval;
    let mut interval = tokio::time::interval_at(start, query.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }

        tokio::select! {
            _ = token.cancelled() => return,
            result = queries.send_async(query.clone()) => {
                if result.is_err() {
                    return;
                }
            }
        }
    }
}

async fn query_worker(
    balancer: Arc<Balancer<QueryClient>>,
    metrics: Arc<Metrics>,
    queries: Receiver<Arc<Query>>,
) {
    while let Ok(query) = queries.recv_async().await {
        let Some((address, client)) = balancer.pick() else {
            tracing::error!("unable to get client, no addresses resolved");
            continue;
        };

        if let Err(error) = execute_query(&client, &metrics, &query).await {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                %address,
                expr = %query.expr,
                "unable to execute query"
            );
        }
    }
}

/// Executes a single query and records its latency.
pub async fn execute_query(
    client: &QueryClient,
    metrics: &Metrics,
    query: &Query,
) -> Result<(), QueryError> {
    let now = SystemTime::now();
    let start = Instant::now();

    let result = if query.is_range() {
        let range_start = now.checked_sub(query.time_range).unwrap_or(UNIX_EPOCH);
        tracing::debug!(expr = %query.expr, range = ?query.time_range, "sending range query");
        client
            .query_range(&query.expr, range_start, now, RANGE_STEP)
            .await
    } else {
        tracing::debug!(expr = %query.expr, "sending instant query");
        client.query(&query.expr, now).await
    };

    let status = if result.is_ok() { "success" } else { "failure" };
    metrics
        .query_request_duration
        .get_or_create(&QueryLabels {
            status,
            r#type: query.kind(),
        })
        .observe(start.elapsed().as_secs_f64());

    result.map(|_| ())
}
