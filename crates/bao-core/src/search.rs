//! # Dynamic-Programming Configuration Search
//!
//! This module decides which optimizer configurations are worth executing for a query.
//! Trying the full power set of tunable optimizers and rules is infeasible, so the
//! search proceeds in **stages** indexed by the number of simultaneously disabled items
//! and builds each stage from the measurements of the stages before it.
//!
//! ## Stages
//!
//! - **Stage 0**: the baseline (nothing disabled). Always first.
//! - **Stage 1**: one configuration per tunable name.
//! - **Stage n >= 2**: every *promising* singleton combined with every *promising*
//!   configuration of stage `n - 1`.
//!
//! A measured configuration is promising when both its median and its mean total
//! runtime are no worse than the baseline's. A configuration whose median or mean is
//! worse than the baseline is **blacklisted**: no later stage proposes a superset of
//! it. This is greedy and assumes that the effects of disabling items roughly add up,
//! trading completeness for a bounded number of executions.
//!
//! ## Termination
//!
//! The search ends when the stage index exceeds the number of tunable names or
//! `max_dp_depth`, when a stage comes out empty, or when the statistics for a stage
//! cannot be computed (for example when the baseline has no measurement yet). The last
//! case is logged and ends the search early instead of failing the run.
//!
//! ## Generation vs. Execution
//!
//! `DpSearch` only generates configurations. It reads prior measurements from
//! [`Storage`] lazily, at the moment the next stage is needed, so the caller is free
//! to execute and record each configuration before asking for the next one. The pure
//! helpers [`dp_combine`] and [`classify_stage`] hold the actual DP step and are
//! usable without any storage.

use crate::config::Configuration;
use crate::span::QuerySpan;
use crate::stats::{RuntimeSummary, StatsError};
use crate::storage::{MeasurementRow, Storage, StorageError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Deepest stage the search will generate by default.
pub const MAX_DP_DEPTH: usize = 2;

/// Configuration knobs for the DP search.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Highest number of simultaneously disabled items to try.
    pub max_dp_depth: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_dp_depth: MAX_DP_DEPTH,
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search space exhausted")]
    Exhausted,
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Configurations known to regress against the baseline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    configs: BTreeSet<Configuration>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, config: Configuration) -> bool {
        self.configs.insert(config)
    }

    pub fn contains(&self, config: &Configuration) -> bool {
        self.configs.contains(config)
    }

    /// Whether some blacklisted configuration is a subset of `candidate`.
    pub fn prunes(&self, candidate: &Configuration) -> bool {
        self.configs.iter().any(|bad| bad.is_subset(candidate))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Configuration> {
        self.configs.iter()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// Outcome of comparing one stage's measurements against the baseline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageClassification {
    /// No worse than baseline on median and mean, sorted.
    pub promising: Vec<Configuration>,
    /// Worse than baseline on median or mean, sorted.
    pub regressed: Vec<Configuration>,
}

/// Group the measurements of configurations with `num_disabled` items and compare
/// each group's median and mean to `baseline`.
pub fn classify_stage(
    rows: &[MeasurementRow],
    num_disabled: usize,
    baseline: &RuntimeSummary,
) -> Result<StageClassification, StatsError> {
    let mut samples: BTreeMap<&Configuration, Vec<f64>> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.num_disabled == num_disabled) {
        samples.entry(&row.configuration).or_default().push(row.total_runtime);
    }

    let mut out = StageClassification::default();
    for (config, runtimes) in samples {
        let summary = RuntimeSummary::of(&runtimes)?;
        if summary.no_worse_than(baseline) {
            out.promising.push(config.clone());
        } else {
            out.regressed.push(config.clone());
        }
    }
    Ok(out)
}

/// The DP step: combine promising singletons with promising configurations of the
/// previous stage.
///
/// A union is dropped when the singleton's name is already part of the previous
/// configuration or when any blacklisted configuration is a subset of it. The result
/// is deduplicated as sets and sorted.
pub fn dp_combine(
    singletons: &[Configuration],
    previous: &[Configuration],
    blacklist: &Blacklist,
) -> Vec<Configuration> {
    let mut result = BTreeSet::new();
    for single in singletons {
        for prev in previous {
            if single.names().any(|name| prev.contains(name)) {
                continue;
            }
            let candidate = prev.union(single);
            if blacklist.prunes(&candidate) {
                debug!("DP: pruned {} (contains a blacklisted configuration)", candidate);
                continue;
            }
            result.insert(candidate);
        }
    }
    result.into_iter().collect()
}

/// Stage-by-stage generator of configurations for one query.
///
/// Use [`DpSearch::has_next`] / [`DpSearch::advance`] (or the `Iterator` impl). The
/// sequence is finite and cannot be restarted; build a new `DpSearch` to search again.
pub struct DpSearch {
    query_path: String,
    storage: Arc<dyn Storage>,
    tunable: Vec<String>,
    config: SearchConfig,
    blacklist: Blacklist,
    /// Index of the stage `configs` belongs to.
    stage: usize,
    configs: Vec<Configuration>,
    /// Position of the current configuration within `configs`.
    cursor: Option<usize>,
    exhausted: bool,
}

impl DpSearch {
    pub fn new(
        query_path: impl Into<String>,
        span: &QuerySpan,
        storage: Arc<dyn Storage>,
        config: SearchConfig,
    ) -> Self {
        Self::with_tunable(query_path, span.tunable(), storage, config)
    }

    /// Search over an explicit list of tunable names.
    pub fn with_tunable(
        query_path: impl Into<String>,
        tunable: Vec<String>,
        storage: Arc<dyn Storage>,
        config: SearchConfig,
    ) -> Self {
        let mut search = Self {
            query_path: query_path.into(),
            storage,
            tunable,
            config,
            blacklist: Blacklist::new(),
            stage: 0,
            configs: Vec::new(),
            cursor: None,
            exhausted: false,
        };
        search.configs = search.generate_stage(0).unwrap_or_default();
        debug!(
            "DP search for {}: {} tunable items, stage 0 has {} configuration(s)",
            search.query_path,
            search.tunable.len(),
            search.configs.len()
        );
        search
    }

    pub fn tunable(&self) -> &[String] {
        &self.tunable
    }

    /// Index of the stage currently being iterated.
    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Configurations of the current stage.
    pub fn stage_configs(&self) -> &[Configuration] {
        &self.configs
    }

    pub fn current(&self) -> Option<&Configuration> {
        self.cursor.and_then(|i| self.configs.get(i))
    }

    /// Canonical key of the current configuration, `None` for the baseline.
    pub fn current_key(&self) -> Option<String> {
        self.current().and_then(Configuration::key)
    }

    /// Whether another configuration is available. Moves on to the next stage (and
    /// reads storage) when the current stage is used up.
    pub fn has_next(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        if self.remaining_in_stage() > 0 {
            return true;
        }
        let next = self.stage + 1;
        match self.generate_stage(next) {
            Some(configs) if !configs.is_empty() => {
                info!("Enter DP stage {}, run {} configurations", next, configs.len());
                self.stage = next;
                self.configs = configs;
                self.cursor = None;
                true
            }
            Some(_) => {
                debug!("DP stage {} is empty, search finished", next);
                self.stage = next;
                self.exhausted = true;
                false
            }
            None => {
                self.exhausted = true;
                false
            }
        }
    }

    /// Move to the next configuration. Fails once the search is exhausted.
    pub fn advance(&mut self) -> Result<&Configuration, SearchError> {
        if !self.has_next() {
            return Err(SearchError::Exhausted);
        }
        let next = self.cursor.map_or(0, |i| i + 1);
        self.cursor = Some(next);
        Ok(&self.configs[next])
    }

    fn remaining_in_stage(&self) -> usize {
        let consumed = self.cursor.map_or(0, |i| i + 1);
        self.configs.len().saturating_sub(consumed)
    }

    /// Build the configurations of stage `n`, or `None` when the search ends.
    fn generate_stage(&mut self, n: usize) -> Option<Vec<Configuration>> {
        if n > self.tunable.len() || n > self.config.max_dp_depth {
            return None;
        }
        match n {
            0 => Some(vec![Configuration::baseline()]),
            1 => Some(
                self.tunable
                    .iter()
                    .map(|name| Configuration::from_names([name.as_str()]))
                    .collect(),
            ),
            _ => match self.dp_stage(n) {
                Ok(configs) => Some(configs),
                Err(SearchError::Stats(err)) => {
                    info!("DP: stage {} for {} stops early: {}", n, self.query_path, err);
                    None
                }
                Err(err) => {
                    warn!("DP: cannot build stage {} for {}: {}", n, self.query_path, err);
                    None
                }
            },
        }
    }

    fn dp_stage(&mut self, n: usize) -> Result<Vec<Configuration>, SearchError> {
        let rows: Vec<MeasurementRow> = self
            .storage
            .get_measurements(&self.query_path)?
            .into_iter()
            .filter(|row| row.configuration.names().all(|name| self.tunable.iter().any(|t| t == name)))
            .collect();

        let baseline_runtimes: Vec<f64> = rows
            .iter()
            .filter(|row| row.configuration.is_baseline())
            .map(|row| row.total_runtime)
            .collect();
        let baseline = RuntimeSummary::of(&baseline_runtimes)?;

        let singles = classify_stage(&rows, 1, &baseline)?;
        let previous = classify_stage(&rows, n - 1, &baseline)?;
        for bad in singles.regressed.iter().chain(previous.regressed.iter()) {
            if self.blacklist.insert(bad.clone()) {
                debug!("DP: blacklisted {} for {}", bad, self.query_path);
            }
        }

        Ok(dp_combine(&singles.promising, &previous.promising, &self.blacklist))
    }
}

impl Iterator for DpSearch {
    type Item = Configuration;

    fn next(&mut self) -> Option<Configuration> {
        self.advance().ok().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::PlanArtifacts;
    use crate::storage::{InMemoryStorage, Measurement};
    use chrono::{DateTime, Duration, Utc};

    const Q: &str = "queries/job/1a.sql";

    fn config(names: &[&str]) -> Configuration {
        Configuration::from_names(names.iter().copied())
    }

    fn record(storage: &InMemoryStorage, c: &Configuration, runtime: f64, plan_hash: i64, seq: i64) {
        storage.register_query_config(Q, c, &PlanArtifacts::default(), plan_hash).unwrap();
        storage
            .register_measurement(
                Q,
                c,
                Measurement {
                    elapsed: runtime,
                    planning: 0.0,
                    scheduling: 0.0,
                    running: runtime,
                    finishing: 0.0,
                    cpu: runtime,
                    input_data_size: 0.0,
                    nodes: 1,
                    plan_hash,
                    time: DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(seq),
                    fingerprint_diverged: false,
                },
            )
            .unwrap();
    }

    fn tunable(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_search_config_defaults() {
        assert_eq!(SearchConfig::default().max_dp_depth, MAX_DP_DEPTH);
    }

    #[test]
    fn test_dp_combine_skips_overlap_and_blacklisted_supersets() {
        let singles = vec![config(&["A"]), config(&["B"]), config(&["C"])];
        let previous = vec![config(&["A"]), config(&["C"])];
        let mut blacklist = Blacklist::new();
        blacklist.insert(config(&["B", "C"]));

        let combined = dp_combine(&singles, &previous, &blacklist);
        // {A,C} appears twice (A+C, C+A) and is deduplicated; {B,C} is blacklisted.
        assert_eq!(combined, vec![config(&["A", "B"]), config(&["A", "C"])]);
    }

    #[test]
    fn test_classify_stage_uses_median_and_mean() {
        let rows: Vec<MeasurementRow> = [
            (config(&["A"]), 800.0),
            (config(&["A"]), 900.0),
            (config(&["B"]), 1200.0),
            (config(&["C"]), 100.0),
            (config(&["C"]), 100.0),
            (config(&["C"]), 5000.0),
            (config(&["A", "B"]), 1.0),
        ]
        .into_iter()
        .map(|(configuration, total_runtime)| MeasurementRow {
            total_runtime,
            num_disabled: configuration.len(),
            configuration,
            time: DateTime::<Utc>::UNIX_EPOCH,
        })
        .collect();
        let baseline = RuntimeSummary { median: 1000.0, mean: 1000.0 };

        let stage = classify_stage(&rows, 1, &baseline).unwrap();
        assert_eq!(stage.promising, vec![config(&["A"])]);
        // C has a good median but a mean above baseline
        assert_eq!(stage.regressed, vec![config(&["B"]), config(&["C"])]);
    }

    #[test]
    fn test_baseline_is_always_first() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.register_query(Q).unwrap();
        let mut search =
            DpSearch::with_tunable(Q, tunable(&["B", "A"]), storage, SearchConfig::default());
        assert!(search.has_next());
        let first = search.advance().unwrap().clone();
        assert!(first.is_baseline());
        assert_eq!(search.current_key(), None);
        assert_eq!(search.stage(), 0);
    }

    #[test]
    fn test_example_scenario_prunes_superset_of_blacklisted() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.register_query(Q).unwrap();
        let mut search = DpSearch::with_tunable(
            Q,
            tunable(&["A", "B"]),
            storage.clone(),
            SearchConfig::default(),
        );

        let baseline = search.advance().unwrap().clone();
        record(&storage, &baseline, 1000.0, 1, 0);

        let a = search.advance().unwrap().clone();
        assert_eq!(search.current_key().as_deref(), Some("A"));
        assert_eq!(search.stage(), 1);
        record(&storage, &a, 800.0, 2, 1);

        let b = search.advance().unwrap().clone();
        assert_eq!(b, config(&["B"]));
        record(&storage, &b, 1200.0, 3, 2);

        // stage 2 would be {A,B}, but {B} regressed
        assert!(!search.has_next());
        assert!(search.blacklist().contains(&config(&["B"])));
        assert!(matches!(search.advance(), Err(SearchError::Exhausted)));
    }

    #[test]
    fn test_stage_two_combines_promising_configs() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.register_query(Q).unwrap();
        let search =
            DpSearch::with_tunable(Q, tunable(&["A", "B", "C"]), storage.clone(), SearchConfig::default());

        let runtimes = [("", 1000.0), ("A", 800.0), ("B", 900.0), ("C", 1100.0)];
        let mut proposed = Vec::new();
        for (seq, c) in search.enumerate() {
            if let Some((_, runtime)) = runtimes.iter().find(|(k, _)| *k == c.joined()) {
                record(&storage, &c, *runtime, seq as i64, seq as i64);
            }
            proposed.push(c.joined());
        }
        assert_eq!(proposed, vec!["", "A", "B", "C", "A,B"]);
    }

    #[test]
    fn test_missing_baseline_stops_search_early() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.register_query(Q).unwrap();
        let search = DpSearch::with_tunable(Q, tunable(&["A", "B"]), storage, SearchConfig::default());
        // nothing recorded: stages 0 and 1 are produced, stage 2 cannot be computed
        let all: Vec<_> = search.map(|c| c.joined()).collect();
        assert_eq!(all, vec!["", "A", "B"]);
    }

    #[test]
    fn test_depth_limits_stages() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.register_query(Q).unwrap();
        let search = DpSearch::with_tunable(
            Q,
            tunable(&["A", "B"]),
            storage,
            SearchConfig { max_dp_depth: 0 },
        );
        assert_eq!(search.count(), 1);

        let empty = DpSearch::with_tunable(
            Q,
            Vec::new(),
            Arc::new(InMemoryStorage::new()),
            SearchConfig::default(),
        );
        let configs: Vec<_> = empty.collect();
        assert_eq!(configs, vec![Configuration::baseline()]);
    }
}
