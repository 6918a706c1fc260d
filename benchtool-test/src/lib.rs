//! Test utilities for the benchmark tool.
//!
//! This crate provides an in-process fake backend and a test logger. See the modules for all
//! available utilities.

pub mod server;
pub mod tracing;
