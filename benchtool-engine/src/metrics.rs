//! Prometheus metrics recorded by the benchmark.
//!
//! All benchmark metrics are registered under the `benchtool` prefix, next to the standard
//! `process_*` metrics, and exposed in the Prometheus text format through [`Metrics::encode`].

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use self::process::ProcessMetrics;

mod process;

/// Latency buckets in seconds, shared by write and query requests.
const LATENCY_BUCKETS: [f64; 14] = [
    0.001, 0.01, 0.1, 0.3, 0.6, 1.0, 3.0, 6.0, 9.0, 20.0, 30.0, 60.0, 90.0, 120.0,
];

fn latency_histogram() -> Histogram {
    Histogram::new(LATENCY_BUCKETS.into_iter())
}

/// Labels of write request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WriteLabels {
    /// The HTTP status code, or `error` if no response was received.
    pub code: String,
}

/// Labels of query request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueryLabels {
    /// Either `success` or `failure`.
    pub status: &'static str,
    /// Either `instant` or `range`.
    pub r#type: &'static str,
}

/// Labels of per-target metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TargetLabels {
    pub target: String,
}

type HistogramFamily<L> = Family<L, Histogram, fn() -> Histogram>;

/// Container for all benchmark metrics.
#[derive(Debug)]
pub struct Metrics {
    registry: Registry,
    process: ProcessMetrics,

    /// Latency of remote-write requests by status code.
    pub write_request_duration: HistogramFamily<WriteLabels>,
    /// Number of batches handed to the write workers.
    pub write_batches: Counter,
    /// Number of series handed to the write workers.
    pub write_series: Counter,
    /// Latency of query requests by outcome and query type.
    pub query_request_duration: HistogramFamily<QueryLabels>,
    /// Number of addresses each endpoint target currently resolves to.
    pub resolved_addresses: Family<TargetLabels, Gauge>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a new registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let process = ProcessMetrics::register(registry.sub_registry_with_prefix("process"));
        let bench = registry.sub_registry_with_prefix("benchtool");

        let write_request_duration =
            HistogramFamily::<WriteLabels>::new_with_constructor(latency_histogram);
        bench.register(
            "write_request_duration_seconds",
            "Time spent doing write requests",
            write_request_duration.clone(),
        );

        let write_batches = Counter::default();
        bench.register(
            "write_batches",
            "Number of batches dispatched to write workers",
            write_batches.clone(),
        );

        let write_series = Counter::default();
        bench.register(
            "write_series",
            "Number of series dispatched to write workers",
            write_series.clone(),
        );

        let query_request_duration =
            HistogramFamily::<QueryLabels>::new_with_constructor(latency_histogram);
        bench.register(
            "query_request_duration_seconds",
            "Time spent doing query requests",
            query_request_duration.clone(),
        );

        let resolved_addresses = Family::<TargetLabels, Gauge>::default();
        bench.register(
            "resolved_addresses",
            "Number of addresses an endpoint resolves to",
            resolved_addresses.clone(),
        );

        Self {
            registry,
            process,
            write_request_duration,
            write_batches,
            write_series,
            query_request_duration,
            resolved_addresses,
        }
    }

    /// Returns the gauge tracking the resolved addresses of `target`.
    pub fn resolved_gauge(&self, target: &str) -> Gauge {
        self.resolved_addresses
            .get_or_create(&TargetLabels {
                target: target.to_owned(),
            })
            .clone()
    }

    /// Encodes all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        self.process.refresh();

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_prefixed_metrics() {
        let metrics = Metrics::new();
        metrics
            .write_request_duration
            .get_or_create(&WriteLabels { code: "200".into() })
            .observe(0.05);
        metrics
            .query_request_duration
            .get_or_create(&QueryLabels {
                status: "success",
                r#type: "range",
            })
            .observe(2.0);
        metrics.write_series.inc_by(42);

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("# HELP benchtool_write_request_duration_seconds"));
        assert!(encoded.contains(r#"benchtool_write_request_duration_seconds_count{code="200"} 1"#));
        assert!(encoded.contains(
            r#"benchtool_query_request_duration_seconds_count{status="success",type="range"} 1"#
        ));
        assert!(encoded.contains("benchtool_write_series_total 42"));
        assert!(encoded.contains("# HELP process_cpu_seconds_total"));
        assert!(encoded.contains("# HELP process_open_fds"));
        assert!(!encoded.contains("benchtool_process_"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reports_process_stats() {
        let metrics = Metrics::new();
        let encoded = metrics.encode().unwrap();

        let value = |name: &str| {
            encoded
                .lines()
                .find(|line| line.starts_with(&format!("{name} ")))
                .and_then(|line| line.rsplit(' ').next())
                .and_then(|value| value.parse::<f64>().ok())
                .unwrap_or_default()
        };

        assert!(value("process_resident_memory_bytes") > 0.0);
        assert!(value("process_open_fds") > 0.0);
        assert!(value("process_start_time_seconds") > 0.0);
    }

    #[test]
    fn uses_latency_buckets() {
        let metrics = Metrics::new();
        metrics
            .write_request_duration
            .get_or_create(&WriteLabels {
                code: "error".into(),
            })
            .observe(100.0);

        let encoded = metrics.encode().unwrap();
        let bucket = |le: &str| {
            encoded
                .lines()
                .find(|line| {
                    line.starts_with("benchtool_write_request_duration_seconds_bucket")
                        && line.contains(&format!("le=\"{le}\""))
                })
                .map(|line| line.rsplit(' ').next().unwrap_or_default().to_owned())
        };

        assert_eq!(bucket("90.0").as_deref(), Some("0"));
        assert_eq!(bucket("120.0").as_deref(), Some("1"));
    }
}
