//! Thin facade over the `slog` ecosystem. Components take a parent `Logger`
//! (or `None`, which wires them to `Discard`) and derive children with
//! whatever context keys they need.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the process root logger, writing to stderr.
///
/// `level` is one of the usual severity names ("trace", "debug", "info",
/// "warning", "error"); anything unrecognized falls back to "debug".
pub fn init(level: &str) -> Logger {
    let severity = match level {
        "trace" => Severity::Trace,
        "info" => Severity::Info,
        "warning" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        _ => Severity::Debug,
    };

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);

    builder.build().expect("Error building terminal logger")
}

/// A logger that swallows everything. Used by components constructed
/// without a parent logger, typically in tests.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Derives the component logger from an optional parent.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(parent: L) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}
