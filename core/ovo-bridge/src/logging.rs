//! Log setup for the bridge.
//!
//! stdout carries the protocol, so logs go to a daily rolling file under the
//! data directory and, with `--log-stderr`, to stderr as well.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEBUG_LOG_ENV: &str = "OVO_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "ovo-bridge.log";

fn filter() -> EnvFilter {
    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// life of the process; dropping it flushes and stops the file writer.
pub fn init(logs_dir: &Path, mirror_stderr: bool) -> Option<WorkerGuard> {
    let (file_layer, guard, file_error) = match fs_err::create_dir_all(logs_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard), None)
        }
        Err(err) => (None, None, Some(err)),
    };

    // Without a log file, stderr is the only place left.
    let stderr_layer = (mirror_stderr || file_layer.is_none())
        .then(|| fmt::layer().with_writer(std::io::stderr));

    let installed = tracing_subscriber::registry()
        .with(filter())
        .with(file_layer)
        .with(stderr_layer)
        .try_init();

    if installed.is_ok() {
        if let Some(err) = file_error {
            tracing::warn!(error = %err, "Log directory unavailable; logging to stderr only");
        }
    }
    guard
}
