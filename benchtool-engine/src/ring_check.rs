//! Periodic report of the expected shard distribution of the write workload.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::ring::{Ring, RingError, shard_token_sorted};
use crate::workload::WriteWorkload;

/// Configuration of the ring cross-checker.
#[derive(Clone, Debug)]
pub struct RingCheckConfig {
    /// Identity of the run, as sent in the `bench_id` label.
    pub id: String,
    /// Tenant the series are sharded for.
    pub tenant_id: String,
    /// Interval between two reports.
    pub interval: Duration,
}

/// Computes which ring instances should own the generated series.
///
/// The checker works on its own copy of the write workload and never affects the write path.
#[derive(Debug)]
pub struct RingChecker {
    config: RingCheckConfig,
    workload: WriteWorkload,
    ring: Arc<dyn Ring>,
}

impl RingChecker {
    /// Creates a checker over a copy of the write workload.
    pub fn new(config: RingCheckConfig, workload: WriteWorkload, ring: Arc<dyn Ring>) -> Self {
        Self {
            config,
            workload,
            ring,
        }
    }

    /// Counts the series each instance should receive at the given time.
    ///
    /// Every series counts once for each instance of its replication set.
    pub fn check(&mut self, now: SystemTime) -> Result<BTreeMap<String, usize>, RingError> {
        let series = self.workload.generate_time_series(&self.config.id, now);

        let mut counts = BTreeMap::new();
        for series in &series {
            let token = shard_token_sorted(&self.config.tenant_id, &series.labels);
            for instance in self.ring.get(token)?.instances {
                *counts.entry(instance).or_default() += 1;
            }
        }

        Ok(counts)
    }

    /// Logs a report every interval until the token is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        let period = self.config.interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }

            match self.check(SystemTime::now()) {
                Ok(counts) => {
                    let total: usize = counts.values().sum();
                    tracing::info!(instances = counts.len(), total, "ring check");
                    for (address, series) in counts {
                        tracing::info!(%address, series, "ring check");
                    }
                }
                Err(error) => tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "ring check failed"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;
    use crate::ring::{InstanceDesc, TokenRing};
    use crate::workload::{WorkloadDesc, WriteOptions};

    fn workload() -> WriteWorkload {
        let desc = WorkloadDesc::from_yaml(
            r#"
            replicas: 2
            series:
              - name: cpu
                type: counter-one
                labels:
                  - name: instance
                    value_prefix: inst
                    unique_values: 50
            "#,
        )
        .unwrap();
        WriteWorkload::with_seed(&desc, WriteOptions::default(), 0)
    }

    fn ring(replication_factor: usize) -> Arc<dyn Ring> {
        let instances = ["ingester-1", "ingester-2", "ingester-3"]
            .into_iter()
            .map(|addr| InstanceDesc {
                addr: addr.into(),
                tokens: vec![],
            })
            .collect();
        Arc::new(TokenRing::new(instances, replication_factor, 128).unwrap())
    }

    fn config() -> RingCheckConfig {
        RingCheckConfig {
            id: "bench-1".into(),
            tenant_id: "fake".into(),
            interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn counts_every_series_once_per_replica() {
        let mut checker = RingChecker::new(config(), workload(), ring(1));
        let counts = checker.check(UNIX_EPOCH).unwrap();

        assert_eq!(counts.values().sum::<usize>(), 100);
        assert!(counts.keys().all(|addr| addr.starts_with("ingester-")));
    }

    #[test]
    fn counts_all_replication_set_members() {
        let mut checker = RingChecker::new(config(), workload(), ring(3));
        let counts = checker.check(UNIX_EPOCH).unwrap();

        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|count| *count == 100));
    }

    #[test]
    fn distribution_is_stable_across_ticks() {
        let mut checker = RingChecker::new(config(), workload(), ring(1));
        let first = checker.check(UNIX_EPOCH).unwrap();
        let second = checker.check(UNIX_EPOCH + Duration::from_secs(15)).unwrap();
        assert_eq!(first, second);
    }
}
