//! Structured logging for the control plane (§10.1).
//!
//! Every long-lived task in the daemon and agent (bus listener, queue
//! sender, reconnect loop, staleness scanner, supervisor command dispatcher)
//! is expected to log its connect/disconnect/error transitions with
//! structured fields — `peer_id`, `channel`, `command_id` — rather than
//! interpolated strings, so a JSON-backed log pipeline can filter and
//! correlate across processes by those keys directly.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ghost_common::logging::init_logging;
//!
//! fn main() {
//!     init_logging("ghostd");
//!
//!     tracing::info!(peer_id = %peer.id, channel = "commands", "peer registered");
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: Set to "json" for JSON output, anything else for text (default: text)
//! - `RUST_LOG`: Standard log level filter (default: info)
//!   Examples: `RUST_LOG=debug`, `RUST_LOG=ghost_agent=trace,ghost_daemon=info`
//!
//! # Correlating a command round trip
//!
//! `command_id` is attached as a span field for the duration of a dispatch,
//! so every log line emitted while handling one command — including from
//! code several calls deep — can be grepped out of a shared log stream:
//!
//! ```rust,ignore
//! use tracing::{info_span, Instrument};
//!
//! async fn dispatch(command: Command) -> Response {
//!     let span = info_span!("dispatch", command_id = %command.command_id, channel = "commands");
//!     async {
//!         tracing::info!("dispatching command");
//!         run(command).await
//!     }.instrument(span).await
//! }
//! ```

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Emits a line to stderr with a `PRE-INIT` prefix. `tracing` silently drops
/// events recorded before a subscriber is installed, so anything logged
/// earlier in `main` than the `init_logging` call (config loading errors,
/// the dotenv load itself) should go through this instead of `tracing::info!`
/// if it needs to be visible (§7, §10.1).
pub fn pre_init_log(message: &str) {
    eprintln!("[PRE-INIT] {message}");
}

/// Initialize logging with the given service name.
///
/// Reads LOG_FORMAT env var to determine output format:
/// - "json" -> JSON output (for production/log aggregation)
/// - anything else -> human-readable text (for development)
///
/// Reads RUST_LOG env var for log level filtering (defaults to INFO).
pub fn init_logging(service_name: &str) {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if log_format.eq_ignore_ascii_case("json") {
        init_json_logging(env_filter);
    } else {
        init_text_logging(env_filter);
    }

    tracing::info!(service = service_name, "logging initialized");
}

/// Initialize JSON logging for production.
fn init_json_logging(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(false)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE)
        )
        .init();
}

/// Initialize human-readable text logging for development.
fn init_text_logging(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true)
        )
        .init();
}

/// Initialize logging with defaults (uses "ghostd" as service name).
pub fn init_default_logging() {
    init_logging("ghostd");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_parsing() {
        // Just verify the filter can be created
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));
        drop(filter);
    }
}
