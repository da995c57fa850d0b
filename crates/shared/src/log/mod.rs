// Logging module
//
// Console output plus an optional daily-rolling log file, both driven by the
// tracing ecosystem. RUST_LOG overrides the configured level.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tracing_appender::rolling;
use std::path::Path;

/// Initialize the logging system
/// `file_name` is the rolling log file written inside `log_dir`.
/// If the directory cannot be created, logging stays on the console and the
/// failure is reported there once the subscriber is up.
pub fn initialize_logging(log_dir: Option<&str>, file_name: &str, log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let mut dir_error = None;
    let file_layer = log_dir.and_then(|dir| {
        if let Err(e) = ensure_log_dir(Path::new(dir)) {
            dir_error = Some((dir.to_string(), e));
            return None;
        }

        let file_appender = rolling::daily(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Keep the guard alive by leaking it (it lives for the program duration)
        std::mem::forget(guard);

        Some(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_ansi(true)
                .with_target(false)
                .with_thread_ids(false),
        )
        .with(file_layer)
        .init();

    if let Some((dir, e)) = dir_error {
        tracing::warn!("Could not create log directory {}: {}, logging to console only", dir, e);
    }
}

fn ensure_log_dir(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(path)
}

/// Map the numeric console log level used in config files to a filter directive
/// (0=error, 1=warn, 2=info, 3=debug, 4 and up=trace)
pub fn map_log_level(level: i32) -> &'static str {
    match level {
        i32::MIN..=0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}
