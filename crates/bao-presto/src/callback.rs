//! # Callback Channel
//!
//! Presto does not return plans, execution statistics or query spans in the query
//! response. It pushes them to a TCP server run by the benchmark, one message per
//! connection, while (or right after) it processes the query that caused them.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+-----------------------------+
//! | length: u32 (BE)     | payload: `length` bytes     |
//! +----------------------+-----------------------------+
//! ```
//!
//! The payload is UTF-8 text starting with a case-sensitive tag:
//!
//! | tag                          | body               | stored as                 |
//! |------------------------------|--------------------|---------------------------|
//! | `json:rules:effective:`      | JSON string array  | span, effective rules     |
//! | `json:rules:required:`       | JSON string array  | span, required rules      |
//! | `json:optimizers:effective:` | JSON string array  | span, effective optimizers|
//! | `json:optimizers:required:`  | JSON string array  | span, required optimizers |
//! | `json:logical:`              | JSON plan          | logical plan JSON         |
//! | `json:fragmented:`           | JSON plan          | fragmented plan JSON      |
//! | `dot:logical:`               | Graphviz text      | logical plan DOT          |
//! | `dot:fragmented:`            | Graphviz text      | fragmented plan DOT       |
//! | any other `json:`            | JSON object        | execution stats           |
//!
//! The tags and their precedence are fixed by the engine and must not change.
//!
//! ## Receive Semantics
//!
//! `receive_one` accepts exactly one connection, reads exactly one frame, dispatches
//! it into the `SessionStatus`, and returns what it applied. A payload is parsed in
//! full before any status field is written, so a malformed message never leaves a
//! half-updated status behind. Framing errors (bad length, connection closed
//! mid-frame, invalid UTF-8) fail that receive only.
//!
//! Waits are bounded when a timeout is configured; a stalled engine then surfaces as
//! `CallbackError::Timeout` instead of blocking the benchmark forever.
//!
//! ## Restart
//!
//! `restart` closes the listening socket and binds a new one on the same address
//! (an ephemeral port chosen at first bind is kept). Connections that were
//! queued on the old socket (e.g. from a query abandoned after an error) are dropped
//! with it, so stale messages can never be attributed to the next query.

use crate::status::SessionStatus;
use bao_core::span::{SpanKind, SpanRole};
use bao_core::stats::ExecutionStats;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, trace};

const JSON: &str = "json:";
const DOT: &str = "dot:";
const RULES: &str = "rules:";
const OPTIMIZERS: &str = "optimizers:";
const EFFECTIVE: &str = "effective:";
const REQUIRED: &str = "required:";
const LOGICAL: &str = "logical:";
const FRAGMENTED: &str = "fragmented:";

/// Upper bound for a single frame. Plans of very large queries stay well below this.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Listen backlog of the callback socket.
const BACKLOG: u32 = 1024;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed in the middle of a frame")]
    Truncated,
    #[error("frame length {0} exceeds the maximum of {MAX_FRAME_LEN} bytes")]
    FrameTooLarge(u32),
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed {tag} payload: {source}")]
    MalformedPayload {
        tag: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown callback message: {0:?}")]
    UnknownMessage(String),
    #[error("no callback received within {0:?}")]
    Timeout(Duration),
    #[error("callback channel is closed")]
    Closed,
}

/// Which plan representation a plan message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    LogicalJson,
    FragmentedJson,
    LogicalDot,
    FragmentedDot,
}

/// A decoded callback payload.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackMessage {
    Span {
        kind: SpanKind,
        role: SpanRole,
        names: Vec<String>,
    },
    Json(PlanKind, Value),
    Dot(PlanKind, String),
    Stats(ExecutionStats),
}

/// What a dispatched message did to the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    Span(SpanKind, SpanRole),
    Plan(PlanKind),
    /// `duplicate` is set when stats for this query id had already been delivered.
    Stats { query_id: String, duplicate: bool },
}

impl CallbackEvent {
    pub fn is_fresh_stats(&self) -> bool {
        matches!(self, CallbackEvent::Stats { duplicate: false, .. })
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(tag: &'static str, body: &str) -> Result<T, CallbackError> {
    serde_json::from_str(body).map_err(|source| CallbackError::MalformedPayload { tag, source })
}

fn preview(message: &str) -> String {
    message.chars().take(64).collect()
}

/// Decode one payload according to the tag table above.
pub fn parse_message(message: &str) -> Result<CallbackMessage, CallbackError> {
    if let Some(rest) = message.strip_prefix(JSON) {
        let rest = rest.trim();
        if let Some(span) = rest.strip_prefix(RULES) {
            return parse_span(SpanKind::Rules, span);
        }
        if let Some(span) = rest.strip_prefix(OPTIMIZERS) {
            return parse_span(SpanKind::Optimizers, span);
        }
        if let Some(plan) = rest.strip_prefix(LOGICAL) {
            return Ok(CallbackMessage::Json(PlanKind::LogicalJson, parse_json("logical plan", plan)?));
        }
        if let Some(plan) = rest.strip_prefix(FRAGMENTED) {
            return Ok(CallbackMessage::Json(
                PlanKind::FragmentedJson,
                parse_json("fragmented plan", plan)?,
            ));
        }
        return Ok(CallbackMessage::Stats(parse_json("execution stats", rest)?));
    }
    if let Some(rest) = message.strip_prefix(DOT) {
        if let Some(dot) = rest.strip_prefix(LOGICAL) {
            return Ok(CallbackMessage::Dot(PlanKind::LogicalDot, dot.to_string()));
        }
        if let Some(dot) = rest.strip_prefix(FRAGMENTED) {
            return Ok(CallbackMessage::Dot(PlanKind::FragmentedDot, dot.to_string()));
        }
    }
    Err(CallbackError::UnknownMessage(preview(message)))
}

fn parse_span(kind: SpanKind, message: &str) -> Result<CallbackMessage, CallbackError> {
    let (role, body) = if let Some(body) = message.strip_prefix(EFFECTIVE) {
        (SpanRole::Effective, body)
    } else if let Some(body) = message.strip_prefix(REQUIRED) {
        (SpanRole::Required, body)
    } else {
        return Err(CallbackError::UnknownMessage(preview(message)));
    };
    Ok(CallbackMessage::Span {
        kind,
        role,
        names: parse_json("query span", body)?,
    })
}

/// Write a decoded message into the status.
pub fn apply(message: CallbackMessage, status: &mut SessionStatus) -> CallbackEvent {
    match message {
        CallbackMessage::Span { kind, role, names } => {
            status.query_span.set(kind, role, names);
            CallbackEvent::Span(kind, role)
        }
        CallbackMessage::Json(kind, plan) => {
            match kind {
                PlanKind::FragmentedJson => status.plans.fragmented_json = Some(plan),
                _ => status.plans.logical_json = Some(plan),
            }
            CallbackEvent::Plan(kind)
        }
        CallbackMessage::Dot(kind, dot) => {
            match kind {
                PlanKind::FragmentedDot => status.plans.fragmented_dot = Some(dot),
                _ => status.plans.logical_dot = Some(dot),
            }
            CallbackEvent::Plan(kind)
        }
        CallbackMessage::Stats(stats) => {
            let query_id = stats.query_id.clone();
            let fresh = status.record_stats(stats);
            if !fresh {
                debug!("Ignoring re-delivered stats for query {}", query_id);
            }
            CallbackEvent::Stats {
                query_id,
                duplicate: !fresh,
            }
        }
    }
}

/// Parse and apply one payload.
pub fn dispatch(message: &str, status: &mut SessionStatus) -> Result<CallbackEvent, CallbackError> {
    Ok(apply(parse_message(message)?, status))
}

/// Read one length-prefixed UTF-8 frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, CallbackError> {
    let mut len_buf = [0u8; 4];
    read_exact(reader, &mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(CallbackError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    read_exact(reader, &mut payload).await?;
    String::from_utf8(payload).map_err(|_| CallbackError::InvalidUtf8)
}

async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), CallbackError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CallbackError::Truncated),
        Err(e) => Err(e.into()),
    }
}

pub fn encode_frame(payload: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 4);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload.as_bytes());
    buf
}

/// Connect to a callback server and push one message, the way the engine does.
pub async fn send_frame(addr: SocketAddr, payload: &str) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&encode_frame(payload)).await?;
    stream.shutdown().await
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

/// Server side of the callback protocol.
pub struct CallbackChannel {
    /// Bound address; restarts bind the same address again.
    addr: SocketAddr,
    listener: Option<TcpListener>,
    timeout: Option<Duration>,
}

impl CallbackChannel {
    pub fn bind(addr: SocketAddr, timeout: Option<Duration>) -> Result<Self, CallbackError> {
        let listener = bind(addr)?;
        let addr = listener.local_addr()?;
        debug!("Callback channel listening on {}", addr);
        Ok(Self {
            addr,
            listener: Some(listener),
            timeout,
        })
    }

    /// Address the engine should connect to.
    pub fn local_addr(&self) -> Result<SocketAddr, CallbackError> {
        let listener = self.listener.as_ref().ok_or(CallbackError::Closed)?;
        Ok(listener.local_addr()?)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_open(&self) -> bool {
        self.listener.is_some()
    }

    /// Block until one message is received and dispatched.
    pub async fn receive_one(&mut self, status: &mut SessionStatus) -> Result<CallbackEvent, CallbackError> {
        let listener = self.listener.as_ref().ok_or(CallbackError::Closed)?;
        let message = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, accept_frame(listener))
                .await
                .map_err(|_| CallbackError::Timeout(limit))??,
            None => accept_frame(listener).await?,
        };
        let event = dispatch(&message, status)?;
        trace!("Callback dispatched: {:?}", event);
        Ok(event)
    }

    /// Receive `n` messages in arrival order.
    pub async fn receive(
        &mut self,
        n: usize,
        status: &mut SessionStatus,
    ) -> Result<Vec<CallbackEvent>, CallbackError> {
        let mut events = Vec::with_capacity(n);
        for _ in 0..n {
            events.push(self.receive_one(status).await?);
        }
        Ok(events)
    }

    /// Drop the listening socket (and everything queued on it) and bind again.
    pub fn restart(&mut self) -> Result<(), CallbackError> {
        if self.listener.take().is_some() {
            debug!("Shut down callback channel to discard previous messages");
        }
        let listener = bind(self.addr)?;
        debug!("Callback channel listening on {}", listener.local_addr()?);
        self.listener = Some(listener);
        Ok(())
    }

    /// Close the listening socket. Later receives fail with `Closed`.
    pub fn shutdown(&mut self) {
        if self.listener.take().is_some() {
            debug!("Callback channel closed");
        }
    }
}

async fn accept_frame(listener: &TcpListener) -> Result<String, CallbackError> {
    let (mut stream, peer) = listener.accept().await?;
    trace!("Callback connection from {}", peer);
    read_frame(&mut stream).await
}
