//! # Benchmark Session
//!
//! A `Session` owns everything needed to talk to one Presto coordinator: the request
//! connection, the callback channel and the `SessionStatus` the channel writes into.
//!
//! ## Query Lifecycle
//!
//! ```text
//! Idle --apply_configuration--> ConfigApplied --run_query--> Executing
//!   ^                                                            |
//!   +------------------ await_stats_callback <-- StatsReceived <-+
//! ```
//!
//! Any failure moves the session to `NeedsReset`. Before the next attempt the caller
//! re-enables all optimizers and rules and applies its configuration again, which
//! brings the session back to `ConfigApplied`.
//!
//! ## Concurrency
//!
//! The engine pushes plan callbacks while it is still answering the request, so the
//! request and the callback receive run concurrently with `tokio::try_join!`. Both
//! must finish; the first error cancels the other and is returned. Status is lent to
//! the channel for the duration of the receive, so no locking is involved.

use crate::callback::{CallbackChannel, CallbackError};
use crate::connection::{EngineConnection, QueryError, QueryOutput};
use crate::properties::{
    BAO_DISABLED_OPTIMIZERS, BAO_DISABLED_RULES, BAO_EXECUTE_QUERY, BAO_EXPORT_GRAPHVIZ,
    BAO_EXPORT_JSON, BAO_GET_QUERY_SPAN, RESET_TO_FALSE,
};
use crate::status::SessionStatus;
use bao_core::config::Configuration;
use bao_core::span::{QuerySpan, SpanError};
use bao_core::stats::ExecutionStats;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Callback(#[from] CallbackError),
    #[error(transparent)]
    Span(#[from] SpanError),
}

impl SessionError {
    /// Whether the engine rejected the query itself, as opposed to the transport or
    /// callback plumbing failing.
    pub fn is_query_failure(&self) -> bool {
        matches!(self, SessionError::Query(QueryError::Failed { .. }))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::Query(e) if e.is_transient())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ConfigApplied,
    Executing,
    StatsReceived,
    NeedsReset,
}

/// Plan export formats the engine pushes for every query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportFlags {
    pub dot: bool,
    pub json: bool,
}

impl ExportFlags {
    /// Plan callbacks per query: logical and fragmented for each enabled format.
    pub fn plan_callbacks(&self) -> usize {
        2 * (self.dot as usize + self.json as usize)
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

pub struct Session<C> {
    connection: C,
    channel: CallbackChannel,
    status: SessionStatus,
    export: ExportFlags,
    state: SessionState,
}

impl<C: EngineConnection> Session<C> {
    pub fn new(connection: C, channel: CallbackChannel) -> Self {
        Self {
            connection,
            channel,
            status: SessionStatus::new(),
            export: ExportFlags::default(),
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn export_flags(&self) -> ExportFlags {
        self.export
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut SessionStatus {
        &mut self.status
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    pub fn callback_addr(&self) -> Result<SocketAddr, CallbackError> {
        self.channel.local_addr()
    }

    fn track<T>(&mut self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if result.is_err() {
            self.state = SessionState::NeedsReset;
        }
        result
    }

    /// Set a session property. Properties unknown to the engine are logged and
    /// ignored; other failures propagate.
    pub async fn set_property(&mut self, name: &str, value: &str) -> Result<(), SessionError> {
        match self.connection.set_session_property(name, value).await {
            Ok(()) => {
                debug!("Set session property {}={}", name, value);
                Ok(())
            }
            Err(QueryError::OptionRejected { name, message }) => {
                warn!("Session property {} not accepted: {}", name, message);
                Ok(())
            }
            Err(e) => {
                let result = Err(e.into());
                self.track(result)
            }
        }
    }

    pub async fn set_config_option(&mut self, name: &str, value: bool) -> Result<(), SessionError> {
        self.set_property(name, flag(value)).await
    }

    /// Turn the plan exports on or off and remember the choice.
    pub async fn configure_exports(&mut self, export: ExportFlags) -> Result<(), SessionError> {
        self.set_config_option(BAO_EXPORT_GRAPHVIZ, export.dot).await?;
        self.set_config_option(BAO_EXPORT_JSON, export.json).await?;
        self.export = export;
        Ok(())
    }

    /// Clear both disabled lists. Idempotent.
    pub async fn enable_all_optimizers_and_rules(&mut self) -> Result<(), SessionError> {
        self.set_property(BAO_DISABLED_OPTIMIZERS, "").await?;
        self.set_property(BAO_DISABLED_RULES, "").await?;
        self.state = SessionState::Idle;
        Ok(())
    }

    /// Disable the configuration's names, split into optimizers and rules according
    /// to the span. Names outside the span's tunable sets are not sent.
    pub async fn apply_configuration(
        &mut self,
        config: &Configuration,
        span: &QuerySpan,
    ) -> Result<(), SessionError> {
        let optimizers = config.restricted_to(&span.tunable_optimizers());
        let rules = config.restricted_to(&span.tunable_rules());
        if optimizers.len() + rules.len() < config.len() {
            warn!("Configuration {} contains names outside the query span", config);
        }
        self.set_property(BAO_DISABLED_OPTIMIZERS, &optimizers.join(",")).await?;
        self.set_property(BAO_DISABLED_RULES, &rules.join(",")).await?;
        self.state = SessionState::ConfigApplied;
        Ok(())
    }

    /// Whether the engine should run the query or only plan it.
    pub async fn set_execute_query(&mut self, execute: bool) -> Result<(), SessionError> {
        self.set_config_option(BAO_EXECUTE_QUERY, execute).await
    }

    /// Execute `sql` while collecting the plan callbacks it produces.
    pub async fn run_query(&mut self, sql: &str) -> Result<QueryOutput, SessionError> {
        self.status.begin_query();
        self.state = SessionState::Executing;
        let plan_callbacks = self.export.plan_callbacks();
        let Self {
            connection,
            channel,
            status,
            ..
        } = self;
        let result = tokio::try_join!(
            async { connection.execute(sql).await.map_err(SessionError::from) },
            async {
                channel
                    .receive(plan_callbacks, status)
                    .await
                    .map_err(SessionError::from)
            },
        )
        .map(|(output, _)| output);
        self.track(result)
    }

    /// Wait for the stats of the query that just ran. Late plan callbacks received
    /// meanwhile are applied to the status as usual.
    pub async fn await_stats_callback(&mut self) -> Result<ExecutionStats, SessionError> {
        loop {
            let event = match self.channel.receive_one(&mut self.status).await {
                Ok(event) => event,
                Err(e) => return self.track(Err(e.into())),
            };
            if event.is_fresh_stats() {
                if let Some(stats) = self.status.take_execution_stats() {
                    self.state = SessionState::StatsReceived;
                    return Ok(stats);
                }
            }
            debug!("Still waiting for execution stats, received {:?}", event);
        }
    }

    /// Ask the engine which rules and optimizers affect `sql`.
    pub async fn discover_span(&mut self, sql: &str) -> Result<QuerySpan, SessionError> {
        self.set_config_option(BAO_GET_QUERY_SPAN, true).await?;
        self.status.begin_query();
        self.state = SessionState::Executing;
        let Self {
            connection,
            channel,
            status,
            ..
        } = self;
        let result = tokio::try_join!(
            async { connection.execute(sql).await.map_err(SessionError::from) },
            async {
                while !status.query_span.is_complete() {
                    channel.receive_one(status).await?;
                }
                Ok::<_, SessionError>(())
            },
        );
        let result = result.and_then(|_| Ok(self.status.take_query_span().build()?));
        let span = self.track(result)?;
        self.set_config_option(BAO_GET_QUERY_SPAN, false).await?;
        self.state = SessionState::Idle;
        Ok(span)
    }

    /// Neutral engine state: no exports, BAO disabled, queries executed, nothing
    /// disabled.
    pub async fn reset_configuration(&mut self) -> Result<(), SessionError> {
        info!("Reset session configuration");
        for name in RESET_TO_FALSE {
            self.set_config_option(name, false).await?;
        }
        self.set_config_option(BAO_EXECUTE_QUERY, true).await?;
        self.export = ExportFlags::default();
        self.enable_all_optimizers_and_rules().await
    }

    /// Drop pending callbacks and start over with an empty status.
    pub fn restart_callbacks(&mut self) -> Result<(), SessionError> {
        self.channel.restart()?;
        self.status = SessionStatus::new();
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.channel.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::QueryStats;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingConnection {
        properties: Vec<(String, String)>,
        reject: Vec<&'static str>,
    }

    #[async_trait]
    impl EngineConnection for RecordingConnection {
        async fn execute(&mut self, _sql: &str) -> Result<QueryOutput, QueryError> {
            Ok(QueryOutput {
                rows: vec![],
                stats: QueryStats::default(),
            })
        }

        async fn set_session_property(&mut self, name: &str, value: &str) -> Result<(), QueryError> {
            if self.reject.contains(&name) {
                return Err(QueryError::OptionRejected {
                    name: name.to_string(),
                    message: "unknown session property".into(),
                });
            }
            self.properties.push((name.to_string(), value.to_string()));
            Ok(())
        }
    }

    fn session(connection: RecordingConnection) -> Session<RecordingConnection> {
        let channel = CallbackChannel::bind("127.0.0.1:0".parse().unwrap(), None).unwrap();
        Session::new(connection, channel)
    }

    fn span() -> QuerySpan {
        QuerySpan {
            effective_rules: vec!["ReorderJoins".into(), "PruneLimitColumns".into()],
            required_rules: vec![],
            effective_optimizers: vec!["PredicatePushDown".into(), "AddExchanges".into()],
            required_optimizers: vec![],
        }
    }

    #[test]
    fn test_plan_callback_count() {
        assert_eq!(ExportFlags::default().plan_callbacks(), 0);
        assert_eq!(ExportFlags { dot: true, json: false }.plan_callbacks(), 2);
        assert_eq!(ExportFlags { dot: true, json: true }.plan_callbacks(), 4);
    }

    #[tokio::test]
    async fn test_apply_configuration_splits_names() {
        let mut s = session(RecordingConnection::default());
        let config = Configuration::from_names(["ReorderJoins", "PredicatePushDown"]);
        s.apply_configuration(&config, &span()).await.unwrap();
        assert_eq!(s.state(), SessionState::ConfigApplied);
        assert_eq!(
            s.connection_mut().properties,
            vec![
                (BAO_DISABLED_OPTIMIZERS.to_string(), "PredicatePushDown".to_string()),
                (BAO_DISABLED_RULES.to_string(), "ReorderJoins".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_option_is_not_an_error() {
        let mut s = session(RecordingConnection {
            reject: vec![BAO_GET_QUERY_SPAN],
            ..Default::default()
        });
        s.set_config_option(BAO_GET_QUERY_SPAN, true).await.unwrap();
        assert!(s.connection_mut().properties.is_empty());
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_reset_configuration_is_neutral() {
        let mut s = session(RecordingConnection::default());
        s.reset_configuration().await.unwrap();
        let props = &s.connection_mut().properties;
        for name in RESET_TO_FALSE {
            assert!(props.contains(&(name.to_string(), "false".to_string())));
        }
        assert!(props.contains(&(BAO_EXECUTE_QUERY.to_string(), "true".to_string())));
        assert!(props.contains(&(BAO_DISABLED_RULES.to_string(), String::new())));
        assert_eq!(s.export_flags(), ExportFlags::default());
    }

    #[tokio::test]
    async fn test_run_query_without_exports_needs_no_callbacks() {
        let mut s = session(RecordingConnection::default());
        let output = s.run_query("SELECT 1").await.unwrap();
        assert!(output.rows.is_empty());
        assert_eq!(s.state(), SessionState::Executing);
    }
}
