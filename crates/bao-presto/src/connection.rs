//! # Engine Connection
//!
//! The request/response side of the conversation with Presto. The benchmark only
//! needs two operations from a connection: execute a statement and set a session
//! property. Everything else (plans, execution stats, query spans) arrives out of
//! band on the callback channel.
//!
//! ## Error Classification
//!
//! Callers react differently to different failures, so errors are typed:
//!
//! - `OptionRejected`: the engine does not know a session property. Not every BAO
//!   property exists in every Presto build, so callers usually just log this.
//! - `NoNodesAvailable`: the cluster has no worker available right now. Transient;
//!   the same execution should be retried.
//! - `Failed`: the query itself failed, e.g. because a disabled rule is required.
//! - `Transport` / `Protocol`: the HTTP exchange broke or returned garbage.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Presto error name reported when no worker can take the query.
pub const NO_NODES_AVAILABLE: &str = "NO_NODES_AVAILABLE";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    #[error("session property {name} rejected: {message}")]
    OptionRejected { name: String, message: String },
    #[error("no execution resources available: {message}")]
    NoNodesAvailable { message: String },
    #[error("query failed ({error_name}): {message}")]
    Failed { error_name: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl QueryError {
    /// Whether the failure is an infrastructure condition worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueryError::NoNodesAvailable { .. })
    }
}

/// Client-side statistics of a finished request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryStats {
    /// Presto query id, used to correlate the pushed execution stats.
    pub query_id: String,
    /// Worker nodes that participated.
    pub nodes: u64,
    /// Final query state (`FINISHED`, ...).
    pub state: String,
}

/// Rows plus the stats handle of one executed statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub rows: Vec<Vec<Value>>,
    pub stats: QueryStats,
}

#[async_trait]
pub trait EngineConnection: Send {
    async fn execute(&mut self, sql: &str) -> Result<QueryOutput, QueryError>;

    /// Set a session property for all following statements.
    async fn set_session_property(&mut self, name: &str, value: &str) -> Result<(), QueryError>;
}

/// Render a session property value as a SQL literal.
pub fn sql_literal(value: &str) -> String {
    match value {
        "true" | "false" => value.to_string(),
        _ => format!("'{}'", value.replace('\'', "''")),
    }
}
