use std::fs::OpenOptions;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
///
/// When `THREADLINE_LOG_FILE` is set, debug-level output is also appended
/// to that file.
pub fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);

    let registry = tracing_subscriber::registry().with(stderr_layer);

    match std::env::var("THREADLINE_LOG_FILE").ok() {
        Some(log_path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .with_context(|| format!("Failed to open log file: {}", log_path))?;

            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG);

            registry
                .with(file_layer)
                .try_init()
                .context("Failed to install tracing subscriber")?;
            eprintln!("File logging enabled: {}", log_path);
        }
        None => registry
            .try_init()
            .context("Failed to install tracing subscriber")?,
    }
    Ok(())
}
