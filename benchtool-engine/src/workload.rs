//! Workload descriptions and the synthetic series they expand into.
//!
//! A [`WorkloadDesc`] is the user-facing YAML schema. It is compiled into a [`WriteWorkload`],
//! which expands every [`SeriesDesc`] into the cross product of its dynamic label values and
//! generates one sample per label set, replica and send tick. Query workloads are built from
//! the same description, see [`QueryWorkload`](crate::query::QueryWorkload).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::template::TemplateError;
use crate::write::proto::{Label, Sample, TimeSeries};

/// The reserved label holding the metric name.
pub const NAME_LABEL: &str = "__name__";
/// The label distinguishing simulated replicas of the same series.
pub const REPLICA_LABEL: &str = "bench_replica";
/// The label carrying the identity of the benchmark run.
pub const ID_LABEL: &str = "bench_id";

/// Errors building a workload from its description.
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// The workload file could not be read.
    #[error("failed to read workload file: {0}")]
    Io(#[from] std::io::Error),
    /// The workload file is not valid YAML or does not match the schema.
    #[error("failed to parse workload description: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// A query expression template is invalid.
    #[error("unable to parse query template: {0}")]
    Template(#[from] TemplateError),
    /// A query requires a series type that no series in the workload has.
    #[error("no series found for query with series type {0}")]
    NoSeriesForType(SeriesType),
    /// Queries select a replica matcher, which needs at least one replica.
    #[error("queries require at least one replica")]
    NoReplicas,
    /// A size or interval option is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// The rule used to generate values of a series.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeriesType {
    /// Always `0`.
    GaugeZero,
    /// A uniformly random value in `[0, 1)` on every tick.
    GaugeRandom,
    /// A counter increasing by one on every tick.
    CounterOne,
    /// A counter increasing by a random positive amount on every tick.
    CounterRandom,
}

impl SeriesType {
    /// All series types.
    pub const ALL: [SeriesType; 4] = [
        SeriesType::GaugeZero,
        SeriesType::GaugeRandom,
        SeriesType::CounterOne,
        SeriesType::CounterRandom,
    ];

    /// Returns the name used in workload descriptions.
    pub fn as_str(self) -> &'static str {
        match self {
            SeriesType::GaugeZero => "gauge-zero",
            SeriesType::GaugeRandom => "gauge-random",
            SeriesType::CounterOne => "counter-one",
            SeriesType::CounterRandom => "counter-random",
        }
    }

    /// Computes the next value of a series from its previous value.
    fn next_value(self, last: f64, rng: &mut impl Rng) -> f64 {
        match self {
            SeriesType::GaugeZero => 0.0,
            SeriesType::GaugeRandom => rng.random::<f64>(),
            SeriesType::CounterOne => last + 1.0,
            SeriesType::CounterRandom => last + f64::from(rng.random_range(1..i32::MAX)),
        }
    }
}

impl fmt::Display for SeriesType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dynamic label that takes `unique_values` different values.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LabelDesc {
    pub name: String,
    pub value_prefix: String,
    pub unique_values: usize,
}

impl LabelDesc {
    fn label(&self, index: usize) -> Label {
        Label::new(&self.name, format!("{}-{index}", self.value_prefix))
    }
}

/// A series template, expanded into one label set per combination of dynamic label values.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SeriesDesc {
    pub name: String,
    #[serde(rename = "type")]
    pub series_type: SeriesType,
    #[serde(default)]
    pub static_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: Vec<LabelDesc>,
}

impl SeriesDesc {
    fn base_label_set(&self) -> Vec<Label> {
        let mut labels = Vec::with_capacity(1 + self.static_labels.len() + self.labels.len());
        labels.push(Label::new(NAME_LABEL, &self.name));
        labels.extend(
            self.static_labels
                .iter()
                .map(|(name, value)| Label::new(name, value)),
        );
        labels
    }

    /// Expands this series into all of its label sets.
    ///
    /// Dynamic labels are applied in declaration order. For every dynamic label, each of its
    /// values is appended to every label set built so far, so the value of the first dynamic
    /// label changes fastest.
    pub fn label_sets(&self) -> Vec<Vec<Label>> {
        let mut label_sets = vec![self.base_label_set()];

        for desc in &self.labels {
            let mut expanded = Vec::with_capacity(label_sets.len() * desc.unique_values);
            for index in 0..desc.unique_values {
                for label_set in &label_sets {
                    let mut label_set = label_set.clone();
                    label_set.push(desc.label(index));
                    expanded.push(label_set);
                }
            }
            label_sets = expanded;
        }

        label_sets
    }

    /// Returns the number of label sets this series expands into.
    pub fn label_set_count(&self) -> usize {
        self.labels.iter().map(|desc| desc.unique_values).product()
    }

    /// Returns the label set at `index` in [`label_sets`](Self::label_sets) order, without
    /// expanding the others.
    pub fn label_set_at(&self, mut index: usize) -> Option<Vec<Label>> {
        if index >= self.label_set_count() {
            return None;
        }

        // Label sets are laid out in mixed radix with the first dynamic label as the least
        // significant digit.
        let mut digits = vec![0; self.labels.len()];
        for (digit, desc) in digits.iter_mut().zip(&self.labels) {
            *digit = index % desc.unique_values;
            index /= desc.unique_values;
        }

        let mut labels = self.base_label_set();
        labels.extend(
            self.labels
                .iter()
                .zip(digits)
                .map(|(desc, digit)| desc.label(digit)),
        );
        Some(labels)
    }
}

/// A query template and the schedule it runs on.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct QueryDesc {
    /// How many queries to derive from this description.
    pub num_queries: usize,
    /// The expression template, see [`ExprTemplate`](crate::template::ExprTemplate).
    pub expr_template: String,
    /// The type of series the queries select from.
    pub series_type: SeriesType,
    /// The interval at which each derived query runs.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// If set, queries are range queries over this time range ending now.
    #[serde(default, with = "humantime_serde")]
    pub time_range: Option<Duration>,
    /// Use a regular expression matcher for the replica label.
    #[serde(default)]
    pub regex: bool,
    /// Additionally match all labels of one randomly chosen label set of the series.
    #[serde(default)]
    pub inject_exact_series_matcher: bool,
}

/// Write options as given in the workload description.
///
/// Unset options fall back to the defaults passed to [`WriteDesc::resolve`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct WriteDesc {
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl WriteDesc {
    /// Merges these options over `defaults` and validates the result.
    pub fn resolve(&self, defaults: WriteOptions) -> Result<WriteOptions, WorkloadError> {
        let options = WriteOptions {
            interval: self.interval.unwrap_or(defaults.interval),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
        };

        if options.batch_size == 0 {
            return Err(WorkloadError::Zero("write batch size"));
        }
        if options.interval.is_zero() {
            return Err(WorkloadError::Zero("write interval"));
        }
        if options.timeout.is_zero() {
            return Err(WorkloadError::Zero("write timeout"));
        }

        Ok(options)
    }
}

/// Effective options of the write path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOptions {
    /// Interval between two generation ticks.
    pub interval: Duration,
    /// Timeout of a single remote-write request.
    pub timeout: Duration,
    /// Maximum number of series per remote-write request.
    pub batch_size: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(15),
            batch_size: 500,
        }
    }
}

/// The user-facing description of a benchmark workload.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct WorkloadDesc {
    /// Number of simulated replicas writing identical data.
    pub replicas: usize,
    #[serde(default)]
    pub series: Vec<SeriesDesc>,
    #[serde(default)]
    pub queries: Vec<QueryDesc>,
    #[serde(default, rename = "write_options")]
    pub write: WriteDesc,
}

impl WorkloadDesc {
    /// Parses a workload description from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, WorkloadError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads and parses a workload description file.
    pub fn from_path(path: &Path) -> Result<Self, WorkloadError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }
}

/// Formats the value of the [`REPLICA_LABEL`] for the given replica.
pub fn replica_name(replica: usize) -> String {
    format!("replica-{replica:05}")
}

/// Converts a point in time to milliseconds since the Unix epoch.
pub fn timestamp_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

/// One series template expanded into its label sets, with its generation state.
#[derive(Clone, Debug)]
struct ExpandedSeries {
    label_sets: Vec<Vec<Label>>,
    series_type: SeriesType,
    last_value: f64,
}

/// The compiled write workload.
///
/// This is the only mutable part of a benchmark: every call to
/// [`generate_time_series`](Self::generate_time_series) advances the value of each series.
#[derive(Clone, Debug)]
pub struct WriteWorkload {
    replicas: usize,
    series: Vec<ExpandedSeries>,
    total_series: usize,
    series_by_type: BTreeMap<SeriesType, usize>,
    options: WriteOptions,

    /// Drives the random series types.
    rng: SmallRng,
}

impl WriteWorkload {
    /// Compiles the write workload of the given description.
    pub fn new(desc: &WorkloadDesc, options: WriteOptions) -> Self {
        Self::with_seed(desc, options, rand::random())
    }

    /// Like [`new`](Self::new), but seeds value generation deterministically.
    pub fn with_seed(desc: &WorkloadDesc, options: WriteOptions, seed: u64) -> Self {
        let mut series_by_type: BTreeMap<_, _> =
            SeriesType::ALL.into_iter().map(|ty| (ty, 0)).collect();
        let mut total_series = 0;

        let series = desc
            .series
            .iter()
            .map(|series_desc| {
                let label_sets = series_desc.label_sets();
                total_series += label_sets.len();
                *series_by_type.entry(series_desc.series_type).or_default() += label_sets.len();

                ExpandedSeries {
                    label_sets,
                    series_type: series_desc.series_type,
                    last_value: 0.0,
                }
            })
            .collect();

        Self {
            replicas: desc.replicas,
            series,
            total_series,
            series_by_type,
            options,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Number of simulated replicas.
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Number of expanded series of a single replica.
    pub fn total_series(&self) -> usize {
        self.total_series
    }

    /// Number of expanded series of a single replica with the given type.
    pub fn series_of_type(&self, series_type: SeriesType) -> usize {
        self.series_by_type
            .get(&series_type)
            .copied()
            .unwrap_or_default()
    }

    /// The effective write options.
    pub fn options(&self) -> WriteOptions {
        self.options
    }

    /// Generates the samples of one send tick.
    ///
    /// The value of every series is advanced once and then emitted for every replica and label
    /// set of that series. All samples carry the timestamp `now` in milliseconds, and are
    /// labeled with [`REPLICA_LABEL`] and [`ID_LABEL`] set to `run_id`.
    pub fn generate_time_series(&mut self, run_id: &str, now: SystemTime) -> Vec<TimeSeries> {
        let timestamp = timestamp_millis(now);

        for series in &mut self.series {
            series.last_value = series
                .series_type
                .next_value(series.last_value, &mut self.rng);
        }

        let id_label = Label::new(ID_LABEL, run_id);
        let mut timeseries = Vec::with_capacity(self.replicas * self.total_series);

        for replica in 0..self.replicas {
            let replica_label = Label::new(REPLICA_LABEL, replica_name(replica));

            for series in &self.series {
                for label_set in &series.label_sets {
                    let mut labels = Vec::with_capacity(label_set.len() + 2);
                    labels.extend_from_slice(label_set);
                    labels.push(replica_label.clone());
                    labels.push(id_label.clone());

                    timeseries.push(TimeSeries {
                        labels,
                        samples: vec![Sample {
                            value: series.last_value,
                            timestamp,
                        }],
                    });
                }
            }
        }

        timeseries
    }
}
