//! Process-wide logging setup for the relay.

/// Initialize process-wide observability (tracing/logging).
///
/// JSON output by default; `OUTBOX_LOG_FORMAT=pretty` switches to
/// human-readable lines for local runs.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    match std::env::var("OUTBOX_LOG_FORMAT").as_deref() {
        Ok("pretty") => tracing::init_pretty(),
        _ => tracing::init(),
    }
}

/// Tracing configuration (filters, layers).
pub mod tracing;
