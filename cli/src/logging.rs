//! Structured logging initialization — the `cli` binary is the only place
//! that installs a `tracing` subscriber (spec §9); library crates only emit
//! through the `tracing` facade.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Keeps the background log-flushing thread alive for the process lifetime;
/// drop it only on shutdown.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initializes the global subscriber: an `EnvFilter` plus an `fmt` layer,
/// optionally JSON-formatted, optionally tee'd to a daily-rolling file.
pub fn init(level: &str, json: bool, log_file: Option<&str>) -> LoggingGuard {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file_path = std::path::Path::new(path);
            let dir = file_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = file_path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("evmlog-downloader.log");

            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let writer = std::io::stdout.and(non_blocking);

            let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            LoggingGuard { _file_guard: Some(guard) }
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            LoggingGuard { _file_guard: None }
        }
    }
}
