use std::io;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tunnelsub_core::InstallPaths;

const DEFAULT_FILTER: &str = "tunnelsub=info,tunnelsub_core=info,tower_http=info";

/// Stdout plus `debug.log` in the installation directory when it exists.
/// The returned guard must live until exit so buffered lines are flushed.
pub fn init(paths: &InstallPaths) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());
    let stdout = tracing_subscriber::fmt::layer().with_writer(io::stdout);

    if !paths.root.is_dir() {
        tracing_subscriber::registry().with(filter).with(stdout).init();
        return None;
    }

    let file_appender = tracing_appender::rolling::never(&paths.root, "debug.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();
    Some(guard)
}
