//! # Presto REST Client
//!
//! Minimal client for the Presto statement protocol:
//!
//! 1. `POST /v1/statement` with the SQL text as body. Identity, catalog, schema and
//!    session properties travel in `X-Presto-*` headers.
//! 2. Follow `nextUri` with `GET` until the server stops returning one, collecting
//!    `data` rows from every page.
//! 3. A page carrying `error` ends the query; `NO_NODES_AVAILABLE` is mapped to the
//!    retryable `QueryError::NoNodesAvailable`.
//!
//! Session properties are client-side state in this protocol. `SET SESSION` is sent
//! to the server for validation; the server answers with `X-Presto-Set-Session` (or
//! `X-Presto-Clear-Session` for `RESET SESSION`) and the client applies that to the
//! property map it sends with every later request.

use crate::connection::{
    sql_literal, EngineConnection, QueryError, QueryOutput, QueryStats, NO_NODES_AVAILABLE,
};
use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

const USER_HEADER: &str = "X-Presto-User";
const CATALOG_HEADER: &str = "X-Presto-Catalog";
const SCHEMA_HEADER: &str = "X-Presto-Schema";

/// Unreserved characters stay literal in `X-Presto-Session` values.
const SESSION_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');
const SESSION_HEADER: &str = "X-Presto-Session";
const SET_SESSION_HEADER: &str = "X-Presto-Set-Session";
const CLEAR_SESSION_HEADER: &str = "X-Presto-Clear-Session";

/// Session property bounding the execution time of every query.
pub const QUERY_MAX_EXECUTION_TIME: &str = "query_max_execution_time";

/// Connection settings for [`PrestoClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Coordinator base URL, e.g. `http://localhost:8080`.
    pub base_url: String,
    pub user: String,
    pub catalog: String,
    pub schema: String,
    /// Value for `query_max_execution_time` (e.g. `"10m"`), if any.
    pub query_max_execution_time: Option<String>,
    /// Timeout of a single HTTP request (not of the whole query).
    pub request_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            user: "admin".to_string(),
            catalog: "tpch".to_string(),
            schema: "tiny".to_string(),
            query_max_execution_time: Some("4m".to_string()),
            request_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    id: String,
    next_uri: Option<String>,
    #[serde(default)]
    data: Option<Vec<Vec<Value>>>,
    #[serde(default)]
    stats: Option<StatementStats>,
    #[serde(default)]
    error: Option<StatementError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementStats {
    #[serde(default)]
    state: String,
    #[serde(default)]
    nodes: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error_name: String,
}

impl From<StatementError> for QueryError {
    fn from(error: StatementError) -> Self {
        if error.error_name == NO_NODES_AVAILABLE {
            QueryError::NoNodesAvailable { message: error.message }
        } else {
            QueryError::Failed {
                error_name: error.error_name,
                message: error.message,
            }
        }
    }
}

fn transport(e: reqwest::Error) -> QueryError {
    QueryError::Transport(e.to_string())
}

pub struct PrestoClient {
    http: reqwest::Client,
    settings: ClientSettings,
    session: BTreeMap<String, String>,
}

impl PrestoClient {
    pub fn new(settings: ClientSettings) -> Result<Self, QueryError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(transport)?;
        let mut session = BTreeMap::new();
        if let Some(limit) = &settings.query_max_execution_time {
            session.insert(QUERY_MAX_EXECUTION_TIME.to_string(), limit.clone());
        }
        Ok(Self {
            http,
            settings,
            session,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Session properties sent with every request.
    pub fn session_properties(&self) -> &BTreeMap<String, String> {
        &self.session
    }

    fn session_header(&self) -> String {
        self.session
            .iter()
            .map(|(k, v)| format!("{}={}", k, encode_component(v)))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn apply_session_headers(&mut self, headers: &HeaderMap) {
        for value in headers.get_all(SET_SESSION_HEADER) {
            let Ok(value) = value.to_str() else { continue };
            if let Some((name, raw)) = value.split_once('=') {
                let decoded = decode_component(raw.trim());
                trace!("Server set session property {}={}", name.trim(), decoded);
                self.session.insert(name.trim().to_string(), decoded);
            }
        }
        for value in headers.get_all(CLEAR_SESSION_HEADER) {
            if let Ok(name) = value.to_str() {
                self.session.remove(name.trim());
            }
        }
    }

    async fn decode_page(
        &mut self,
        response: reqwest::Response,
    ) -> Result<StatementResponse, QueryError> {
        let status = response.status();
        self.apply_session_headers(response.headers());
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueryError::Transport(format!("HTTP {}: {}", status, body.trim())));
        }
        let body = response.bytes().await.map_err(transport)?;
        serde_json::from_slice(&body).map_err(|e| QueryError::Protocol(e.to_string()))
    }

    /// Run a statement to completion and return all rows.
    pub async fn query(&mut self, sql: &str) -> Result<QueryOutput, QueryError> {
        let url = format!("{}/v1/statement", self.settings.base_url.trim_end_matches('/'));
        let mut request = self
            .http
            .post(url)
            .header(USER_HEADER, &self.settings.user)
            .header(CATALOG_HEADER, &self.settings.catalog)
            .header(SCHEMA_HEADER, &self.settings.schema)
            .body(sql.to_string());
        if !self.session.is_empty() {
            request = request.header(SESSION_HEADER, self.session_header());
        }
        let response = request.send().await.map_err(transport)?;
        let mut page = self.decode_page(response).await?;
        debug!("Presto accepted query {}", page.id);

        let mut rows = Vec::new();
        loop {
            if let Some(error) = page.error.take() {
                return Err(error.into());
            }
            if let Some(data) = page.data.take() {
                rows.extend(data);
            }
            let Some(next) = page.next_uri.take() else { break };
            let query_id = page.id.clone();
            let response = self
                .http
                .get(&next)
                .header(USER_HEADER, &self.settings.user)
                .send()
                .await
                .map_err(transport)?;
            page = self.decode_page(response).await?;
            if page.id != query_id {
                return Err(QueryError::Protocol(format!(
                    "query id changed from {} to {} while paging",
                    query_id, page.id
                )));
            }
        }

        let stats = page.stats.unwrap_or_default();
        Ok(QueryOutput {
            rows,
            stats: QueryStats {
                query_id: page.id,
                nodes: stats.nodes,
                state: stats.state,
            },
        })
    }
}

#[async_trait]
impl EngineConnection for PrestoClient {
    async fn execute(&mut self, sql: &str) -> Result<QueryOutput, QueryError> {
        self.query(sql).await
    }

    async fn set_session_property(&mut self, name: &str, value: &str) -> Result<(), QueryError> {
        let sql = format!("SET SESSION {} = {}", name, sql_literal(value));
        match self.query(&sql).await {
            Ok(_) => {
                // the accepted value wins over whatever an earlier header left behind
                self.session.insert(name.to_string(), value.to_string());
                Ok(())
            }
            Err(QueryError::Failed { message, .. }) => Err(QueryError::OptionRejected {
                name: name.to_string(),
                message,
            }),
            Err(e) => Err(e),
        }
    }
}

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, SESSION_VALUE).to_string()
}

fn decode_component(value: &str) -> String {
    percent_decode_str(&value.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}
