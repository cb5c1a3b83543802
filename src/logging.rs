//! Structured logging setup (SPEC_FULL.md §10.1): one `tracing_subscriber`
//! initialization per binary, env-driven level via `RUST_LOG` (default
//! `info`), plus a non-blocking rolling file writer under
//! `data_dir/logs/<component>.log` for each long-lived subsystem.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Must be kept alive for the lifetime of the process; dropping it stops the
/// background writer thread and silently truncates buffered lines.
pub struct LogGuard(#[allow(dead_code)] WorkerGuard);

/// Initializes the global subscriber with a stdout layer and a rolling-daily
/// file layer for `component` under `data_dir/logs/` (spec §6.4).
pub fn init(data_dir: &Path, component: &str) -> LogGuard {
    let logs_dir = data_dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        eprintln!("warning: could not create log directory {logs_dir:?}: {e}");
    }

    let file_appender = tracing_appender::rolling::daily(&logs_dir, format!("{component}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false));

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: global tracing subscriber already set");
    }

    LogGuard(guard)
}
