//! # Benchmark Orchestrator
//!
//! Drives one query at a time through the two benchmark phases:
//!
//! 1. **Span discovery** (`discover_query_span`): ask the engine which optimizers
//!    and rules affect the query and store the span.
//! 2. **Configuration search** (`search_optimizer_configurations`): walk the DP
//!    search over the tunable part of the span and measure every proposed
//!    configuration.
//!
//! ## Measuring One Configuration
//!
//! ```text
//! enable everything, disable the configuration's items
//!   |
//!   +-- already measured (earlier run)?          -> skip
//!   |
//!   +-- probe: plan only (bao_execute_query=false), wait for its stats
//!   |     +-- plan hash already produced by another configuration -> duplicate, skip
//!   |
//!   +-- repeat N times: execute, wait for stats
//!         +-- no nodes available  -> retry, does not count as a repeat
//!         +-- query failed        -> configuration unusable, stop
//!         +-- duplicate plan      -> stop
//!         +-- stats of another query first -> drop them, wait for the right ones,
//!         |                                   discard this run
//!         +-- otherwise fingerprint the rows and record a measurement
//! ```
//!
//! After the last stage the baseline runs once more with everything enabled.
//!
//! ## Failure Handling
//!
//! Query failures only make a configuration unusable. Transport and callback
//! failures abandon the attempt: the callback channel is restarted (dropping any
//! stale messages) and the disabled lists are cleared before the search moves on.
//! A failing query never stops the run over the remaining queries.

use crate::queries::{load_query, QueryFileError};
use crate::settings::DriverSettings;
use bao_core::config::Configuration;
use bao_core::fingerprint::hash_result;
use bao_core::search::{DpSearch, SearchError};
use bao_core::span::QuerySpan;
use bao_core::stats::ExecutionStats;
use bao_core::storage::{Measurement, Storage, StorageError};
use bao_presto::connection::{EngineConnection, QueryOutput};
use bao_presto::properties::{BAO_EXPORT_TIMES, BAO_GET_QUERY_SPAN};
use bao_presto::session::{Session, SessionError};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    QueryFile(#[from] QueryFileError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("no query span recorded for {0}; run span discovery first")]
    MissingSpan(String),
}

/// Counters of one configuration search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchReport {
    /// Configurations proposed by the search.
    pub configurations: usize,
    /// Configurations that reached the timed executions.
    pub executed: usize,
    /// Configurations measured by an earlier run.
    pub skipped: usize,
    /// Configurations whose plan another configuration already produced.
    pub duplicates: usize,
    /// Configurations the engine could not run, or attempts abandoned after errors.
    pub failed: usize,
    pub measurements: usize,
    /// Runs dropped because the stats belonged to another query.
    pub discarded: usize,
    /// Measurements whose result fingerprint differs from the canonical one.
    pub divergences: usize,
}

/// Benchmark phase applied to every query of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Span,
    Record,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: Vec<PathBuf>,
}

enum Attempt {
    Done(QueryOutput),
    Unusable,
}

pub struct Orchestrator<C> {
    session: Session<C>,
    storage: Arc<dyn Storage>,
    settings: DriverSettings,
}

impl<C: EngineConnection> Orchestrator<C> {
    pub fn new(session: Session<C>, storage: Arc<dyn Storage>, settings: DriverSettings) -> Self {
        Self {
            session,
            storage,
            settings,
        }
    }

    pub fn session_mut(&mut self) -> &mut Session<C> {
        &mut self.session
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Bring the engine session into the neutral state and enable the configured
    /// plan exports.
    pub async fn prepare_session(&mut self) -> Result<(), OrchestratorError> {
        self.session.reset_configuration().await?;
        self.session.configure_exports(self.settings.export).await?;
        Ok(())
    }

    /// Run `mode` for every query. Failures are logged and counted; they never stop
    /// the remaining queries.
    pub async fn run_queries(&mut self, mode: Mode, queries: &[PathBuf]) -> RunSummary {
        let mut summary = RunSummary::default();
        for path in queries {
            let query_path = path.to_string_lossy();
            let result = match mode {
                Mode::Span => self.discover_query_span(&query_path).await.map(|_| ()),
                Mode::Record => self
                    .search_optimizer_configurations(&query_path)
                    .await
                    .map(|report| info!("Finished {}: {:?}", query_path, report)),
            };
            match result {
                Ok(()) => summary.succeeded += 1,
                Err(e) => {
                    error!("Query {} failed: {}", query_path, e);
                    summary.failed.push(path.clone());
                    if let Err(e) = self.recover().await {
                        error!("Could not recover the session after {}: {}", query_path, e);
                    }
                }
            }
        }
        summary
    }

    /// Ask the engine for the span of a query and store it.
    pub async fn discover_query_span(&mut self, query_path: &str) -> Result<QuerySpan, OrchestratorError> {
        info!("Discover query span for {}", query_path);
        self.storage.register_query(query_path)?;
        let sql = load_query(Path::new(query_path))?;

        let result = self.session.discover_span(&sql).await;
        // plans or stats exported by the span run must not leak into the next query
        self.session.restart_callbacks()?;
        let span = match result {
            Ok(span) => span,
            Err(e) => {
                self.session.set_config_option(BAO_GET_QUERY_SPAN, false).await?;
                return Err(e.into());
            }
        };
        debug!(
            "Span of {}: {} effective / {} required optimizers, {} effective / {} required rules",
            query_path,
            span.effective_optimizers.len(),
            span.required_optimizers.len(),
            span.effective_rules.len(),
            span.required_rules.len()
        );
        self.storage.register_query_span(query_path, &span)?;
        Ok(span)
    }

    /// Search and measure optimizer configurations for a query with a known span.
    pub async fn search_optimizer_configurations(
        &mut self,
        query_path: &str,
    ) -> Result<SearchReport, OrchestratorError> {
        let span = self
            .storage
            .get_query_span(query_path)?
            .ok_or_else(|| OrchestratorError::MissingSpan(query_path.to_string()))?;
        let sql = load_query(Path::new(query_path))?;
        info!("Start DP for query {}", query_path);

        self.session.set_config_option(BAO_EXPORT_TIMES, true).await?;
        let mut search = DpSearch::new(
            query_path,
            &span,
            self.storage.clone(),
            self.settings.search.clone(),
        );
        let mut report = SearchReport::default();

        while search.has_next() {
            let config = search.advance()?.clone();
            report.configurations += 1;
            let result = self
                .measure_configuration(query_path, &sql, &config, &span, &mut report)
                .await;
            self.absorb(result, query_path, &config, &mut report).await?;
        }

        // re-run the default configuration with all optimizers enabled again
        let baseline = Configuration::baseline();
        let result = match self.session.enable_all_optimizers_and_rules().await {
            Ok(()) => {
                self.run_repeats(query_path, &sql, &baseline, &span, &mut report)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        self.absorb(result, query_path, &baseline, &mut report).await?;

        info!("Found {} duplicated query plans for {}", report.duplicates, query_path);
        Ok(report)
    }

    /// Session failures abandon the attempt; anything else ends the search.
    async fn absorb(
        &mut self,
        result: Result<(), OrchestratorError>,
        query_path: &str,
        config: &Configuration,
        report: &mut SearchReport,
    ) -> Result<(), OrchestratorError> {
        match result {
            Ok(()) => Ok(()),
            Err(OrchestratorError::Session(e)) => {
                warn!("Abandon configuration {} of {}: {}", config, query_path, e);
                report.failed += 1;
                self.recover().await
            }
            Err(e) => Err(e),
        }
    }

    /// Drop pending callbacks and return to a clean session configuration.
    async fn recover(&mut self) -> Result<(), OrchestratorError> {
        self.session.restart_callbacks()?;
        self.session.set_execute_query(true).await?;
        self.session.enable_all_optimizers_and_rules().await?;
        Ok(())
    }

    async fn apply(&mut self, config: &Configuration, span: &QuerySpan) -> Result<(), SessionError> {
        self.session.enable_all_optimizers_and_rules().await?;
        self.session.apply_configuration(config, span).await
    }

    async fn measure_configuration(
        &mut self,
        query_path: &str,
        sql: &str,
        config: &Configuration,
        span: &QuerySpan,
        report: &mut SearchReport,
    ) -> Result<(), OrchestratorError> {
        self.apply(config, span).await?;

        if self.storage.check_existing_measurement(query_path, config)? {
            info!("Skip {} for {}: measured by an earlier run", config, query_path);
            report.skipped += 1;
            return Ok(());
        }

        // plan only, to find out whether this configuration produces a new plan
        self.session.set_execute_query(false).await?;
        let probe = self.execute(sql, config, span).await;
        self.session.set_execute_query(true).await?;
        let output = match probe? {
            Attempt::Done(output) => output,
            Attempt::Unusable => {
                report.failed += 1;
                return self.recover().await;
            }
        };

        let (stats, _) = self.await_stats_of(&output.stats.query_id, report).await?;
        let plans = self.session.status_mut().take_plans();
        if self
            .storage
            .register_query_config(query_path, config, &plans, stats.plan_hash)?
        {
            info!("Plan hash {} of {} already known, skip", stats.plan_hash, config);
            report.duplicates += 1;
            return Ok(());
        }

        self.run_repeats(query_path, sql, config, span, report).await
    }

    /// Execute once, retrying while the cluster has no nodes available. A query
    /// failure is reported as `Attempt::Unusable`.
    async fn execute(
        &mut self,
        sql: &str,
        config: &Configuration,
        span: &QuerySpan,
    ) -> Result<Attempt, SessionError> {
        let mut retries = 0;
        loop {
            match self.session.run_query(sql).await {
                Ok(output) => return Ok(Attempt::Done(output)),
                Err(e) if e.is_transient() && retries < self.settings.max_transient_retries => {
                    retries += 1;
                    warn!(
                        "Cluster not ready ({}), retry {}/{} for {}",
                        e, retries, self.settings.max_transient_retries, config
                    );
                    tokio::time::sleep(self.settings.transient_backoff).await;
                    self.session.restart_callbacks()?;
                    self.apply(config, span).await?;
                }
                Err(e) if e.is_query_failure() => {
                    error!("{} cannot be disabled, skip this configuration: {}", config, e);
                    return Ok(Attempt::Unusable);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Receive stats until those of `query_id` arrive. Stats of any other query are
    /// dropped and counted as discarded; the flag tells whether that happened.
    async fn await_stats_of(
        &mut self,
        query_id: &str,
        report: &mut SearchReport,
    ) -> Result<(ExecutionStats, bool), SessionError> {
        let mut out_of_order = false;
        loop {
            let stats = self.session.await_stats_callback().await?;
            if stats.query_id == query_id {
                return Ok((stats, out_of_order));
            }
            error!("Wrong execution stats received: {} vs {}", stats.query_id, query_id);
            report.discarded += 1;
            out_of_order = true;
        }
    }

    async fn run_repeats(
        &mut self,
        query_path: &str,
        sql: &str,
        config: &Configuration,
        span: &QuerySpan,
        report: &mut SearchReport,
    ) -> Result<(), OrchestratorError> {
        report.executed += 1;
        for repeat in 0..self.settings.repeats {
            debug!("Run {} of {} ({}/{})", config, query_path, repeat + 1, self.settings.repeats);
            let output = match self.execute(sql, config, span).await? {
                Attempt::Done(output) => output,
                Attempt::Unusable => {
                    report.failed += 1;
                    return self.recover().await;
                }
            };

            let (stats, out_of_order) = self.await_stats_of(&output.stats.query_id, report).await?;
            if out_of_order {
                debug!("Drop run {} of {} after out-of-order stats", repeat + 1, config);
                continue;
            }
            let plans = self.session.status_mut().take_plans();
            if self
                .storage
                .register_query_config(query_path, config, &plans, stats.plan_hash)?
            {
                info!("{} results in an already known query plan", config);
                report.duplicates += 1;
                break;
            }

            let fingerprint = hash_result(&output.rows);
            let fingerprint_matches = self
                .storage
                .register_query_fingerprint(query_path, fingerprint)?;
            if !fingerprint_matches {
                warn!(
                    "Result fingerprint {} of {} does not match the existing fingerprint",
                    fingerprint, config
                );
                report.divergences += 1;
            }

            self.storage.register_measurement(
                query_path,
                config,
                Measurement {
                    elapsed: stats.elapsed,
                    planning: stats.planning,
                    scheduling: stats.scheduling,
                    running: stats.running,
                    finishing: stats.finishing,
                    cpu: stats.cpu,
                    input_data_size: stats.input_data_size,
                    nodes: output.stats.nodes,
                    plan_hash: stats.plan_hash,
                    time: Utc::now(),
                    fingerprint_diverged: !fingerprint_matches,
                },
            )?;
            report.measurements += 1;
        }
        Ok(())
    }
}
