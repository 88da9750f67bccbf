//! # Session Status
//!
//! Everything the engine pushes over the callback channel lands in one
//! `SessionStatus` owned by the `Session`. It is an explicit context object: the
//! callback channel writes to it only while the session lends it out during a
//! receive, and the orchestrator reads from it only between receives. With a single
//! query in flight there is exactly one writer and one reader per query.
//!
//! ## Lifetime
//!
//! - `begin_query` clears plans, stats and the span under construction before each
//!   execution so nothing from the previous query can be attributed to the next.
//! - `recorded_stats` outlives `begin_query`. It remembers every query id whose stats
//!   were delivered so a re-delivery is recognized instead of overwriting the stats of
//!   the query currently being measured. Only a full callback restart clears it.

use bao_core::span::QuerySpanBuilder;
use bao_core::stats::{ExecutionStats, PlanArtifacts};
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct SessionStatus {
    pub query_span: QuerySpanBuilder,
    pub plans: PlanArtifacts,
    pub execution_stats: Option<ExecutionStats>,
    /// Query ids whose stats were delivered since the last callback restart.
    pub recorded_stats: HashSet<String>,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset per-query fields ahead of an execution.
    pub fn begin_query(&mut self) {
        self.query_span = QuerySpanBuilder::default();
        self.plans = PlanArtifacts::default();
        self.execution_stats = None;
    }

    pub fn take_plans(&mut self) -> PlanArtifacts {
        std::mem::take(&mut self.plans)
    }

    pub fn take_execution_stats(&mut self) -> Option<ExecutionStats> {
        self.execution_stats.take()
    }

    pub fn take_query_span(&mut self) -> QuerySpanBuilder {
        std::mem::take(&mut self.query_span)
    }

    /// Store freshly delivered stats. Returns `false` (and leaves the current stats
    /// alone) when stats for this query id were delivered before.
    pub fn record_stats(&mut self, stats: ExecutionStats) -> bool {
        if !self.recorded_stats.insert(stats.query_id.clone()) {
            return false;
        }
        self.execution_stats = Some(stats);
        true
    }
}
