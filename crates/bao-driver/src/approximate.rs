//! # Query Span Approximation
//!
//! A black-box alternative to asking the engine for the span: disable one optimizer
//! at a time and compare `EXPLAIN (FORMAT JSON)` output against the default plan.
//!
//! - plan differs from the default plan: the optimizer is **effective**
//! - `EXPLAIN` fails: the optimizer is **required**
//! - plan unchanged: the optimizer does not matter for this query
//!
//! Optimizers can mask each other. With `find_alternatives`, all effective
//! optimizers are disabled together and the remaining ones are probed again against
//! that plan; anything that now changes the plan is an **alternative**. This repeats
//! until a round finds nothing new.
//!
//! Costs one `EXPLAIN` per knob and round, so it is far slower than the engine-side
//! span export; it exists for engines without that integration.

use bao_presto::connection::{EngineConnection, QueryError};
use bao_presto::properties::BAO_DISABLED_OPTIMIZERS;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpanApproximation {
    pub effective: Vec<String>,
    pub required: Vec<String>,
    /// Optimizers that only matter once the effective ones are disabled.
    pub alternatives: Vec<String>,
}

/// Plan of `sql` with `disabled` optimizers switched off, `None` if planning fails.
async fn explain<C: EngineConnection>(
    conn: &mut C,
    sql: &str,
    disabled: &[String],
) -> Result<Option<Value>, QueryError> {
    conn.set_session_property(BAO_DISABLED_OPTIMIZERS, &disabled.join(","))
        .await?;
    match conn.execute(&format!("EXPLAIN (FORMAT JSON) {}", sql)).await {
        Ok(output) => Ok(output
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())),
        Err(QueryError::Failed { message, .. }) => {
            debug!("Planning failed with {:?} disabled: {}", disabled, message);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

pub async fn approximate_query_span<C: EngineConnection>(
    conn: &mut C,
    sql: &str,
    knobs: &[String],
    find_alternatives: bool,
) -> Result<SpanApproximation, QueryError> {
    let result = approximate(conn, sql, knobs, find_alternatives).await;
    conn.set_session_property(BAO_DISABLED_OPTIMIZERS, "").await?;
    result
}

async fn approximate<C: EngineConnection>(
    conn: &mut C,
    sql: &str,
    knobs: &[String],
    find_alternatives: bool,
) -> Result<SpanApproximation, QueryError> {
    let default_plan = explain(conn, sql, &[]).await?.ok_or_else(|| QueryError::Failed {
        error_name: "EXPLAIN".into(),
        message: "query cannot be planned with all optimizers enabled".into(),
    })?;

    let mut span = SpanApproximation::default();
    let mut remaining = Vec::new();
    for knob in knobs {
        match explain(conn, sql, std::slice::from_ref(knob)).await? {
            None => span.required.push(knob.clone()),
            Some(plan) if plan != default_plan => span.effective.push(knob.clone()),
            Some(_) => remaining.push(knob.clone()),
        }
    }
    info!(
        "{} effective and {} required optimizers among {} knobs",
        span.effective.len(),
        span.required.len(),
        knobs.len()
    );

    if !find_alternatives {
        return Ok(span);
    }
    let mut disabled = span.effective.clone();
    while !disabled.is_empty() && !remaining.is_empty() {
        let Some(base_plan) = explain(conn, sql, &disabled).await? else {
            debug!("Effective optimizers cannot be disabled together");
            break;
        };
        let mut found = Vec::new();
        for knob in &remaining {
            let mut candidate = disabled.clone();
            candidate.push(knob.clone());
            if let Some(plan) = explain(conn, sql, &candidate).await? {
                if plan != base_plan {
                    found.push(knob.clone());
                }
            }
        }
        if found.is_empty() {
            break;
        }
        info!("Detected {} alternative optimizers", found.len());
        remaining.retain(|knob| !found.contains(knob));
        disabled.extend(found.iter().cloned());
        span.alternatives.extend(found);
    }
    Ok(span)
}
