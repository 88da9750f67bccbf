//! Session properties understood by the BAO-enabled Presto build.
//!
//! Boolean flags switch the engine's callback exports on and off; the two
//! `*_disabled_*` properties carry comma-separated name lists.

/// Master switch for the BAO integration inside Presto.
pub const BAO_ENABLE: &str = "bao_enable";
/// When false, Presto plans the query and reports stats without running it.
pub const BAO_EXECUTE_QUERY: &str = "bao_execute_query";
/// Push logical and fragmented plans as Graphviz DOT.
pub const BAO_EXPORT_GRAPHVIZ: &str = "bao_export_graphviz";
/// Push logical and fragmented plans as JSON.
pub const BAO_EXPORT_JSON: &str = "bao_export_json";
/// Push execution statistics after every query.
pub const BAO_EXPORT_TIMES: &str = "bao_export_times";
/// Push the query span (effective/required rules and optimizers).
pub const BAO_GET_QUERY_SPAN: &str = "bao_get_query_span";
pub const BAO_DISABLED_OPTIMIZERS: &str = "bao_disabled_optimizers";
pub const BAO_DISABLED_RULES: &str = "bao_disabled_rules";

/// Flags switched off when a session is reset to its neutral state.
pub const RESET_TO_FALSE: &[&str] = &[
    BAO_EXPORT_GRAPHVIZ,
    BAO_EXPORT_JSON,
    BAO_EXPORT_TIMES,
    BAO_ENABLE,
    BAO_GET_QUERY_SPAN,
];
