use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber: stdout plus a plain-text debug log in
/// `base_dir`. Keep the returned guard alive for the process lifetime or
/// buffered file lines are lost.
pub fn init_logger(base_dir: &Path, debug_log: &str, verbose: bool) -> WorkerGuard {
    let file_appender = rolling::never(base_dir, debug_log);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    tracing::info!(
        "Gateway logger initialized. Debug log: {}",
        base_dir.join(debug_log).display()
    );

    guard
}
