//! # bao-driver: Rule Configuration Benchmark
//!
//! Runs benchmark queries against a BAO-enabled Presto and records, per query,
//! which optimizers and rules matter and how fast the query runs with subsets of
//! them disabled.
//!
//! ## Module Overview
//!
//! - **`orchestrator`**: span discovery and the measured DP search per query.
//! - **`approximate`**: `EXPLAIN`-based span approximation without engine support.
//! - **`queries`**: loading and discovering benchmark query files.
//! - **`settings`**: `DriverSettings`, the knobs of a benchmark run.

pub mod approximate;
pub mod orchestrator;
pub mod queries;
pub mod settings;
