//! The benchtool binary.
//!
//! Loads the configuration and the workload file, then runs the enabled benchmarks from
//! [`benchtool_engine`] next to a small HTTP server exposing their metrics.

pub mod cli;
pub mod config;
pub mod observability;
pub mod runner;
pub mod web;
