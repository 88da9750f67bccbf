//! # Execution Statistics
//!
//! Presto pushes one statistics object per executed query over the callback channel.
//! This module defines that payload, the plan artifacts that accompany it, and the
//! summary statistics (median, mean) the DP search computes over repeated runs.
//!
//! ## Timing Fields
//!
//! All durations are milliseconds as reported by the engine:
//!
//! - `elapsed`: wall clock from submission to completion.
//! - `planning`, `scheduling`: time before any split runs. These are excluded from
//!   the runtime the search optimizes, because disabling rules mostly trades planning
//!   effort for execution effort and the benchmark targets the latter.
//! - `running`, `finishing`: execution proper. `running + finishing` is the
//!   **total runtime** used everywhere a configuration is compared to the baseline.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Opaque equality token for a physical plan, computed by the engine.
pub type PlanHash = i64;

/// Statistics object pushed by Presto after a query finished (or was only planned).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Presto query id; correlates the callback with the request that caused it.
    pub query_id: String,
    #[serde(default)]
    pub elapsed: f64,
    #[serde(default)]
    pub planning: f64,
    #[serde(default)]
    pub scheduling: f64,
    #[serde(default)]
    pub running: f64,
    #[serde(default)]
    pub finishing: f64,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub input_data_size: f64,
    pub plan_hash: PlanHash,
    /// Any further keys the engine sends are kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExecutionStats {
    pub fn total_runtime(&self) -> f64 {
        self.running + self.finishing
    }
}

/// Plan representations exported by the engine while a query is planned.
///
/// Each field is only populated when the corresponding export flag is enabled on
/// the session (`bao_export_graphviz` for DOT, `bao_export_json` for JSON).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanArtifacts {
    pub logical_dot: Option<String>,
    pub fragmented_dot: Option<String>,
    pub logical_json: Option<Value>,
    pub fragmented_json: Option<Value>,
}

impl PlanArtifacts {
    pub fn is_empty(&self) -> bool {
        self.logical_dot.is_none()
            && self.fragmented_dot.is_none()
            && self.logical_json.is_none()
            && self.fragmented_json.is_none()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsError {
    /// Median and mean are undefined for an empty sample.
    #[error("no samples available")]
    NoSamples,
}

/// Median of a runtime sample. Even-sized samples average the two middle values.
pub fn median(samples: &[f64]) -> Result<f64, StatsError> {
    if samples.is_empty() {
        return Err(StatsError::NoSamples);
    }
    let mut sorted: Vec<OrderedFloat<f64>> = samples.iter().copied().map(OrderedFloat).collect();
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Ok(sorted[mid].0)
    } else {
        Ok((sorted[mid - 1].0 + sorted[mid].0) / 2.0)
    }
}

pub fn mean(samples: &[f64]) -> Result<f64, StatsError> {
    if samples.is_empty() {
        return Err(StatsError::NoSamples);
    }
    Ok(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Median and mean of one configuration's runtimes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeSummary {
    pub median: f64,
    pub mean: f64,
}

impl RuntimeSummary {
    pub fn of(samples: &[f64]) -> Result<Self, StatsError> {
        Ok(Self {
            median: median(samples)?,
            mean: mean(samples)?,
        })
    }

    /// At least as fast as `baseline` on both median and mean.
    pub fn no_worse_than(&self, baseline: &RuntimeSummary) -> bool {
        self.median <= baseline.median && self.mean <= baseline.mean
    }
}
