//! # bao-core: Optimizer Configuration Search Core
//!
//! This crate holds the engine-independent parts of the Presto rule benchmark: what
//! an optimizer configuration is, which part of the optimizer a query can be tuned
//! over, how to decide which configurations to execute next, and how to recognize
//! that two executions produced the same plan or the same result.
//!
//! ## Module Overview
//!
//! - **`config`**: `Configuration`, a set of disabled optimizers/rules with a canonical key.
//! - **`span`**: `QuerySpan`, the effective/required optimizers and rules of a query.
//! - **`search`**: the stage-wise DP search (`DpSearch`) with blacklist pruning.
//! - **`stats`**: execution statistics pushed by the engine, plan artifacts, median/mean.
//! - **`fingerprint`**: result-set digests used to detect semantic drift.
//! - **`storage`**: the `Storage` trait and an in-memory implementation.

pub mod config;
pub mod fingerprint;
pub mod search;
pub mod span;
pub mod stats;
pub mod storage;
