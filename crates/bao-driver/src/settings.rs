//! # Driver Settings
//!
//! Knobs of a benchmark run that are independent of the Presto connection itself.
//! The binary fills them from command-line arguments (with environment fallbacks);
//! tests construct them directly, usually starting from `Default`.

use bao_core::search::SearchConfig;
use bao_presto::session::ExportFlags;
use std::net::SocketAddr;
use std::time::Duration;

/// Default address of the callback server the engine connects to.
pub const DEFAULT_CALLBACK_ADDR: &str = "127.0.0.1:9999";

#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Timed executions per configuration.
    pub repeats: usize,
    /// How often one execution is retried while the cluster reports no available
    /// nodes. Retries do not count as repeats.
    pub max_transient_retries: usize,
    /// Pause between two transient retries.
    pub transient_backoff: Duration,
    /// Plan formats the engine exports for every query.
    pub export: ExportFlags,
    pub search: SearchConfig,
    pub callback_addr: SocketAddr,
    /// Upper bound for a single callback wait; `None` waits forever.
    pub callback_timeout: Option<Duration>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            repeats: 1,
            max_transient_retries: 10,
            transient_backoff: Duration::from_secs(5),
            export: ExportFlags::default(),
            search: SearchConfig::default(),
            callback_addr: SocketAddr::from(([127, 0, 0, 1], 9999)),
            callback_timeout: Some(Duration::from_secs(600)),
        }
    }
}
