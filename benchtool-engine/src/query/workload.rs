//! Derivation of concrete queries from query descriptions.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::template::ExprTemplate;
use crate::workload::{
    NAME_LABEL, REPLICA_LABEL, SeriesDesc, SeriesType, WorkloadDesc, WorkloadError, replica_name,
};

/// A concrete query with its schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    /// The rendered PromQL expression.
    pub expr: String,
    /// Interval between two executions.
    pub interval: Duration,
    /// The range of a range query, or zero for an instant query.
    pub time_range: Duration,
}

impl Query {
    /// Returns `true` if this is a range query.
    pub fn is_range(&self) -> bool {
        !self.time_range.is_zero()
    }

    /// Either `range` or `instant`.
    pub fn kind(&self) -> &'static str {
        if self.is_range() { "range" } else { "instant" }
    }
}

/// The list of queries derived from a workload description.
///
/// Derivation is seeded with the Adler-32 checksum of the run identity, so that repeated runs with
/// the same identity and description produce the same queries. The generator is ChaCha8, whose
/// output is stable across platforms and releases.
#[derive(Clone, Debug, Default)]
pub struct QueryWorkload {
    queries: Vec<Query>,
}

impl QueryWorkload {
    /// Derives the queries of `desc` for the given run identity.
    pub fn new(run_id: &str, desc: &WorkloadDesc) -> Result<Self, WorkloadError> {
        if desc.queries.is_empty() {
            return Ok(Self::default());
        }
        if desc.replicas == 0 {
            return Err(WorkloadError::NoReplicas);
        }

        let mut series_by_type: BTreeMap<SeriesType, Vec<&SeriesDesc>> = BTreeMap::new();
        for series in &desc.series {
            series_by_type
                .entry(series.series_type)
                .or_default()
                .push(series);
        }

        let seed = adler2::adler32_slice(run_id.as_bytes());
        let mut rng = ChaCha8Rng::seed_from_u64(u64::from(seed));

        let mut queries = Vec::new();
        for query_desc in &desc.queries {
            if query_desc.interval.is_zero() {
                return Err(WorkloadError::Zero("query interval"));
            }

            let template = ExprTemplate::parse(&query_desc.expr_template)?;
            let candidates = series_by_type
                .get(&query_desc.series_type)
                .map(Vec::as_slice)
                .unwrap_or_default();
            if candidates.is_empty() {
                return Err(WorkloadError::NoSeriesForType(query_desc.series_type));
            }

            for _ in 0..query_desc.num_queries {
                let series = candidates[rng.random_range(0..candidates.len())];

                let replica = rng.random_range(0..desc.replicas);
                let operator = if query_desc.regex { "=~" } else { "=" };
                let mut matchers = vec![format!(
                    "{REPLICA_LABEL}{operator}{}",
                    quote(&replica_name(replica))
                )];

                if query_desc.inject_exact_series_matcher {
                    let count = series.label_set_count();
                    let labels = match count {
                        0 => None,
                        _ => series.label_set_at(rng.random_range(0..count)),
                    };

                    matchers.extend(
                        labels
                            .into_iter()
                            .flatten()
                            .filter(|label| label.name != NAME_LABEL)
                            .map(|label| format!("{}={}", label.name, quote(&label.value))),
                    );
                }

                queries.push(Query {
                    expr: template.render(&series.name, &matchers.join(",")),
                    interval: query_desc.interval,
                    time_range: query_desc.time_range.unwrap_or_default(),
                });
            }
        }

        Ok(Self { queries })
    }

    /// The derived queries.
    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    /// Returns `true` if there are no queries.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// Quotes a label value as a PromQL string literal.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str(r"\\"),
            '"' => quoted.push_str(r#"\""#),
            '\n' => quoted.push_str(r"\n"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}
