//! # bao-presto: Presto Integration
//!
//! Everything that talks to a BAO-enabled Presto coordinator. Queries go out over
//! the Presto REST protocol; plans, execution statistics and query spans come back
//! asynchronously over a TCP callback channel the engine connects to.
//!
//! ## Module Overview
//!
//! - **`callback`**: the callback server, its length-prefixed framing and tag dispatch.
//! - **`status`**: `SessionStatus`, the per-session store the callback channel writes into.
//! - **`connection`**: the `EngineConnection` trait and the typed `QueryError`.
//! - **`client`**: `PrestoClient`, the `reqwest`-based `EngineConnection`.
//! - **`properties`**: names of the BAO session properties.
//! - **`session`**: `Session`, which drives a query and its callbacks together.

pub mod callback;
pub mod client;
pub mod connection;
pub mod properties;
pub mod session;
pub mod status;
