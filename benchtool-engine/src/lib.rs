//! The benchmark workload engine.
//!
//! This crate turns a declarative [`WorkloadDesc`](workload::WorkloadDesc) into synthetic
//! Prometheus series and PromQL queries, and drives them against a Cortex-style backend:
//!
//! - [`write::WriteBench`] generates samples on every send tick, splits them into batches and
//!   pushes them through a bounded worker pool using the remote-write protocol.
//! - [`query::QueryRunner`] fires every configured query on its own schedule against the query
//!   API.
//! - [`ring_check::RingChecker`] periodically computes which ring instances should own the
//!   generated series.
//!
//! Writes and queries are load balanced on the client side across all addresses that the
//! configured endpoint resolves to, see [`balancer::Balancer`].
#![warn(missing_debug_implementations)]

pub mod balancer;
pub mod discovery;
pub mod error;
pub mod http;
pub mod metrics;
pub mod query;
pub mod ring;
pub mod ring_check;
pub mod template;
pub mod workload;
pub mod write;

pub use crate::error::SetupError;
pub use crate::query::{QueryRunner, QueryWorkload};
pub use crate::ring_check::RingChecker;
pub use crate::workload::{WorkloadDesc, WriteWorkload};
pub use crate::write::WriteBench;
