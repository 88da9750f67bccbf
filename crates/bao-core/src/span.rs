//! # Query Spans
//!
//! The query span of a query is the set of optimizers and rules that matter for it:
//!
//! - **effective**: disabling the item changes the plan Presto chooses.
//! - **required**: disabling the item makes planning fail.
//!
//! Presto distinguishes iterative-optimizer *rules* from whole plan *optimizers*, so
//! the span is tracked for both kinds. Only the *tunable* part of the span is searched:
//! effective items minus required items minus a fixed set of items that are always
//! required by the engine.
//!
//! A span is discovered once per query (either pushed by Presto over the callback
//! channel or approximated via `EXPLAIN`), stored, and read back unchanged by the
//! search engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Optimizers that no configuration may disable.
pub const ALWAYS_REQUIRED_OPTIMIZERS: &[&str] = &["AddExchanges", "AddLocalExchanges"];

/// Rules that no configuration may disable.
pub const ALWAYS_REQUIRED_RULES: &[&str] = &[];

/// Which kind of optimizer component a span list describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Rules,
    Optimizers,
}

/// Whether a span list contains effective or required items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanRole {
    Effective,
    Required,
}

/// The full query span of one query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpan {
    pub effective_rules: Vec<String>,
    pub required_rules: Vec<String>,
    pub effective_optimizers: Vec<String>,
    pub required_optimizers: Vec<String>,
}

impl QuerySpan {
    pub fn tunable_optimizers(&self) -> Vec<String> {
        tunable(
            &self.effective_optimizers,
            &self.required_optimizers,
            ALWAYS_REQUIRED_OPTIMIZERS,
        )
    }

    pub fn tunable_rules(&self) -> Vec<String> {
        tunable(&self.effective_rules, &self.required_rules, ALWAYS_REQUIRED_RULES)
    }

    /// Tunable optimizers followed by tunable rules, each group sorted.
    pub fn tunable(&self) -> Vec<String> {
        let mut names = self.tunable_optimizers();
        names.extend(self.tunable_rules());
        names
    }
}

fn tunable(effective: &[String], required: &[String], always: &[&str]) -> Vec<String> {
    let excluded: BTreeSet<&str> = required
        .iter()
        .map(String::as_str)
        .chain(always.iter().copied())
        .collect();
    effective
        .iter()
        .filter(|name| !excluded.contains(name.as_str()))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpanError {
    #[error("query span is missing the {0} list")]
    Missing(&'static str),
}

/// A query span under construction, filled in one list at a time as the four span
/// callbacks arrive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySpanBuilder {
    pub effective_rules: Option<Vec<String>>,
    pub required_rules: Option<Vec<String>>,
    pub effective_optimizers: Option<Vec<String>>,
    pub required_optimizers: Option<Vec<String>>,
}

impl QuerySpanBuilder {
    pub fn set(&mut self, kind: SpanKind, role: SpanRole, names: Vec<String>) {
        let slot = match (kind, role) {
            (SpanKind::Rules, SpanRole::Effective) => &mut self.effective_rules,
            (SpanKind::Rules, SpanRole::Required) => &mut self.required_rules,
            (SpanKind::Optimizers, SpanRole::Effective) => &mut self.effective_optimizers,
            (SpanKind::Optimizers, SpanRole::Required) => &mut self.required_optimizers,
        };
        *slot = Some(names);
    }

    pub fn is_complete(&self) -> bool {
        self.effective_rules.is_some()
            && self.required_rules.is_some()
            && self.effective_optimizers.is_some()
            && self.required_optimizers.is_some()
    }

    pub fn build(self) -> Result<QuerySpan, SpanError> {
        Ok(QuerySpan {
            effective_rules: self.effective_rules.ok_or(SpanError::Missing("effective rules"))?,
            required_rules: self.required_rules.ok_or(SpanError::Missing("required rules"))?,
            effective_optimizers: self
                .effective_optimizers
                .ok_or(SpanError::Missing("effective optimizers"))?,
            required_optimizers: self
                .required_optimizers
                .ok_or(SpanError::Missing("required optimizers"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tunable_excludes_required_and_always_required() {
        let span = QuerySpan {
            effective_rules: names(&["ReorderJoins", "PushLimitThroughProject", "InlineProjections"]),
            required_rules: names(&["InlineProjections"]),
            effective_optimizers: names(&["AddExchanges", "PredicatePushDown", "HashGenerationOptimizer"]),
            required_optimizers: names(&["HashGenerationOptimizer"]),
        };
        assert_eq!(span.tunable_optimizers(), names(&["PredicatePushDown"]));
        assert_eq!(span.tunable_rules(), names(&["PushLimitThroughProject", "ReorderJoins"]));
        assert_eq!(
            span.tunable(),
            names(&["PredicatePushDown", "PushLimitThroughProject", "ReorderJoins"])
        );
    }

    #[test]
    fn test_builder_requires_all_four_lists() {
        let mut builder = QuerySpanBuilder::default();
        builder.set(SpanKind::Rules, SpanRole::Effective, names(&["r"]));
        builder.set(SpanKind::Rules, SpanRole::Required, vec![]);
        builder.set(SpanKind::Optimizers, SpanRole::Effective, names(&["o"]));
        assert!(!builder.is_complete());
        assert_eq!(
            builder.clone().build(),
            Err(SpanError::Missing("required optimizers"))
        );

        builder.set(SpanKind::Optimizers, SpanRole::Required, vec![]);
        let span = builder.build().unwrap();
        assert_eq!(span.tunable(), names(&["o", "r"]));
    }
}
