//! Logging setup.

use crate::ipc::messages::get_debug_log_path;
use chrono::Utc;
use std::fs;
use std::io::Write;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_ENV: &str = "CLAUDE_BLOCKER_LOG";

fn env_filter(debug: bool) -> EnvFilter {
    if debug {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing. Logs go to stderr; with `debug` they are also written to
/// the debug log file, which is truncated on startup.
///
/// Keep the returned guard alive until exit so buffered file output is flushed.
pub fn init_logging(debug: bool) -> Option<WorkerGuard> {
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter(debug));

    if !debug {
        tracing_subscriber::registry().with(stderr).init();
        return None;
    }

    let path = get_debug_log_path();
    let file = path
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| fs::File::create(&path))
        .and_then(|mut file| {
            writeln!(file, "=== claude-blocker debug log started at {} ===", Utc::now())?;
            Ok(file)
        });

    match file {
        Ok(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new("debug"));
            tracing_subscriber::registry()
                .with(stderr)
                .with(file_layer)
                .init();
            Some(guard)
        }
        Err(err) => {
            tracing_subscriber::registry().with(stderr).init();
            warn!(path = %path.display(), error = %err, "Debug log unavailable");
            None
        }
    }
}
