//! Logger (A2, `SPEC_FULL.md` §4.9).
//!
//! Plain text, one event per line, prefixed with level and timestamp, written both to stderr
//! and to a rolling file under `log_dir` (created recursively if it does not yet exist).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Map a `SPEC_FULL.md` §6 `log_level` value onto a `tracing` directive.
///
/// `tracing` has no literal `FATAL` level, so it is mapped onto `ERROR`, the closest level it
/// exposes.
fn directive(log_level: &str) -> &'static str {
    match log_level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARN" => "warn",
        "FATAL" => "error",
        _ => "info",
    }
}

/// Initialise the process-wide `tracing` subscriber.
///
/// Returns a [`WorkerGuard`] that must be kept alive for the lifetime of the process: dropping
/// it flushes and stops the non-blocking file writer.
pub fn init(log_level: &str, log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| Error::Configuration(format!("failed to create {}: {}", log_dir.display(), e)))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "mongosync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_new(directive(log_level))
        .map_err(|e| Error::Configuration(format!("invalid log_level: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(non_blocking.and(std::io::stderr))
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_levels() {
        assert_eq!(directive("DEBUG"), "debug");
        assert_eq!(directive("warn"), "warn");
        assert_eq!(directive("FATAL"), "error");
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(directive("whatever"), "info");
    }
}
